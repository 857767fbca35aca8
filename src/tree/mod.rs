//! Binary space-partition tree over tabulated points.
//!
//! Leaves are stored compositions; internal nodes carry separating
//! hyperplanes built from the leaf ellipsoids at insertion time. The
//! deletion scheme follows the classic binary-search-tree transplant,
//! simplified by the invariant that every vertex has at least one leaf
//! slot or child missing on the path being removed.
//!
//! Nodes and leaves live in arenas indexed by integer handles;
//! parent and back-pointer links are handles too, so the cyclic
//! structure needs no reference counting. A handle is valid until its
//! vertex is freed, and the tree is the only party minting them.

mod balance;
mod node;
mod search;

pub use node::{Child, LeafId, Node, NodeId};

use crate::ellipsoid::ChemPoint;
use crate::IsatConfig;

/// Space-partition tree with arena storage.
///
/// Structural invariants, restored after every public call:
/// 1. one root; a one-leaf tree parks its leaf in the left slot of a
///    hyperplane-less placeholder; with two or more leaves every
///    reachable node has both sides occupied
/// 2. every leaf's back-pointer names the node holding it
/// 3. `size` equals the number of reachable leaves
/// 4. no deletion leaves a node with two empty sides
#[derive(Debug)]
pub struct BinaryTree {
    nodes: Vec<Option<Node>>,
    node_free: Vec<usize>,
    leaves: Vec<Option<ChemPoint>>,
    leaf_free: Vec<usize>,
    root: Option<NodeId>,
    size: usize,

    max_elements: usize,
    max_2nd_search: usize,
    n_2nd_search: usize,
    min_balance_threshold: usize,
    max_nb_balance_test: usize,
    balance_prop: f64,
}

impl BinaryTree {
    /// Create an empty tree sized and tuned from the cache
    /// configuration.
    pub fn new(config: &IsatConfig) -> Self {
        Self {
            nodes: Vec::new(),
            node_free: Vec::new(),
            leaves: Vec::new(),
            leaf_free: Vec::new(),
            root: None,
            size: 0,
            max_elements: config.max_elements,
            max_2nd_search: config.max_2nd_search,
            n_2nd_search: 0,
            min_balance_threshold: config.min_balance_threshold,
            max_nb_balance_test: config.max_nb_balance_test,
            balance_prop: config.balance_prop,
        }
    }

    /// Number of stored leaves.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Has the tree reached its leaf cap?
    pub fn is_full(&self) -> bool {
        self.size >= self.max_elements
    }

    /// Is the tree empty?
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Leaf EOA tests spent by the most recent secondary search.
    pub fn n_2nd_search(&self) -> usize {
        self.n_2nd_search
    }

    /// Borrow a stored leaf.
    ///
    /// Panics on a stale handle: a caller holding one has broken the
    /// ownership contract and the tree cannot be trusted further.
    pub fn leaf(&self, id: LeafId) -> &ChemPoint {
        self.leaves[id.0].as_ref().expect("stale leaf handle")
    }

    /// Mutably borrow a stored leaf.
    pub fn leaf_mut(&mut self, id: LeafId) -> &mut ChemPoint {
        self.leaves[id.0].as_mut().expect("stale leaf handle")
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().expect("stale node handle")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().expect("stale node handle")
    }

    /// Iterate over stored leaves in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (LeafId, &ChemPoint)> {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|leaf| (LeafId(i), leaf)))
    }

    /// Insert a tabulated point.
    ///
    /// With two or more leaves the new point is spliced next to
    /// `nearest` (located by a primary search when not supplied): a
    /// fresh node replaces the nearest leaf's slot and takes the old
    /// leaf on its left and the new one on its right.
    pub fn insert(&mut self, leaf: ChemPoint, nearest: Option<LeafId>) -> LeafId {
        match self.size {
            0 => {
                let leaf_id = self.alloc_leaf(leaf);
                let root_id = self.alloc_node(Node::placeholder(leaf_id));
                self.leaf_mut(leaf_id).set_node(Some(root_id));
                self.root = Some(root_id);
                self.size = 1;
                leaf_id
            }
            1 => {
                let old_root = self.root.expect("one-leaf tree has a root");
                let existing = match self.node(old_root).left {
                    Some(Child::Leaf(l)) => l,
                    _ => panic!("one-leaf tree must hold its leaf in the left root slot"),
                };
                let new_id = self.alloc_leaf(leaf);
                let fresh = Node::between(
                    self.leaf(existing),
                    existing,
                    self.leaf(new_id),
                    new_id,
                    None,
                );
                self.free_node(old_root);
                let root_id = self.alloc_node(fresh);
                self.root = Some(root_id);
                self.leaf_mut(existing).set_node(Some(root_id));
                self.leaf_mut(new_id).set_node(Some(root_id));
                self.size = 2;
                new_id
            }
            _ => {
                let nearest = nearest
                    .or_else(|| self.primary_search(leaf.phi()))
                    .expect("populated tree yields a nearest leaf");
                let new_id = self.alloc_leaf(leaf);
                self.splice(nearest, new_id);
                self.size += 1;
                new_id
            }
        }
    }

    /// Replace `nearest`'s slot with a fresh node holding `nearest` on
    /// the left and `new_id` on the right. Used by insertion and by the
    /// rebuild; the caller accounts for `size`.
    pub(crate) fn splice(&mut self, nearest: LeafId, new_id: LeafId) {
        let parent = self
            .leaf(nearest)
            .node()
            .expect("tabulated leaf has a containing node");
        let fresh = Node::between(
            self.leaf(nearest),
            nearest,
            self.leaf(new_id),
            new_id,
            Some(parent),
        );
        let node_id = self.alloc_node(fresh);
        self.node_mut(parent)
            .replace_child(Child::Leaf(nearest), Child::Node(node_id));
        self.leaf_mut(nearest).set_node(Some(node_id));
        self.leaf_mut(new_id).set_node(Some(node_id));
    }

    /// Remove a leaf, reshaping the surrounding nodes.
    ///
    /// The removed leaf's node disappears with it: a sibling leaf is
    /// promoted into the grandparent slot (or becomes a one-leaf
    /// placeholder root), a sibling node is transplanted up.
    pub fn delete_leaf(&mut self, x: LeafId) {
        assert!(self.size > 0, "delete from empty tree");
        if self.size == 1 {
            let root = self.root.take().expect("one-leaf tree has a root");
            self.free_node(root);
            self.free_leaf(x);
            self.size = 0;
            return;
        }

        let z = self.leaf(x).node().expect("tabulated leaf has a node");
        let sibling = self.other_side(z, Child::Leaf(x));
        match sibling {
            Child::Leaf(s) => match self.node(z).parent {
                None => {
                    // x's node was the root of a two-leaf tree.
                    let placeholder = self.alloc_node(Node::placeholder(s));
                    self.root = Some(placeholder);
                    self.leaf_mut(s).set_node(Some(placeholder));
                }
                Some(grandparent) => {
                    self.node_mut(grandparent)
                        .replace_child(Child::Node(z), Child::Leaf(s));
                    self.leaf_mut(s).set_node(Some(grandparent));
                }
            },
            Child::Node(n) => self.transplant(z, n),
        }
        self.free_leaf(x);
        self.free_node(z);
        self.size -= 1;
    }

    /// Replace subtree `u` with subtree `v` in `u`'s parent.
    fn transplant(&mut self, u: NodeId, v: NodeId) {
        let parent = self.node(u).parent;
        match parent {
            None => self.root = Some(v),
            Some(p) => self.node_mut(p).replace_child(Child::Node(u), Child::Node(v)),
        }
        self.node_mut(v).parent = parent;
    }

    /// Drop every leaf and node and reset to the empty state.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.node_free.clear();
        self.leaves.clear();
        self.leaf_free.clear();
        self.root = None;
        self.size = 0;
        self.n_2nd_search = 0;
    }

    /// Depth of the tree: node levels on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.depth_below(self.root)
    }

    fn depth_below(&self, from: Option<NodeId>) -> usize {
        match from {
            None => 0,
            Some(id) => {
                let node = self.node(id);
                let left = match node.left {
                    Some(Child::Node(n)) => self.depth_below(Some(n)),
                    _ => 0,
                };
                let right = match node.right {
                    Some(Child::Node(n)) => self.depth_below(Some(n)),
                    _ => 0,
                };
                1 + left.max(right)
            }
        }
    }

    /// Leftmost leaf of the subtree rooted at `from`.
    pub fn tree_min(&self, from: NodeId) -> Option<LeafId> {
        let mut current = from;
        loop {
            match self.node(current).left {
                Some(Child::Node(n)) => current = n,
                Some(Child::Leaf(l)) => return Some(l),
                None => return None,
            }
        }
    }

    /// In-order successor of a leaf, `None` at the tree maximum.
    pub fn tree_successor(&self, x: LeafId) -> Option<LeafId> {
        if self.size <= 1 {
            return None;
        }
        let z = self.leaf(x).node().expect("tabulated leaf has a node");
        let node = self.node(z);
        if node.side_of(Child::Leaf(x)) == Some(false) {
            // Coming from the left slot: the successor is the smallest
            // entry of the right side.
            return match node.right {
                Some(Child::Leaf(r)) => Some(r),
                Some(Child::Node(n)) => self.tree_min(n),
                None => panic!("node with an empty side in a populated tree"),
            };
        }
        // Coming from the right: climb until we leave a left slot.
        let mut y = z;
        while let Some(p) = self.node(y).parent {
            if self.node(p).side_of(Child::Node(y)) == Some(false) {
                return match self.node(p).right {
                    Some(Child::Leaf(r)) => Some(r),
                    Some(Child::Node(n)) => self.tree_min(n),
                    None => panic!("node with an empty side in a populated tree"),
                };
            }
            y = p;
        }
        None
    }

    /// All leaves, in-order.
    pub fn in_order_leaves(&self) -> Vec<LeafId> {
        let mut out = Vec::with_capacity(self.size);
        let Some(root) = self.root else {
            return out;
        };
        let mut current = self.tree_min(root);
        while let Some(id) = current {
            out.push(id);
            current = self.tree_successor(id);
        }
        out
    }

    /// Check the structural invariants, returning a description of the
    /// first violation found.
    pub fn validate_structure(&self) -> Result<(), String> {
        let Some(root) = self.root else {
            return if self.size == 0 {
                Ok(())
            } else {
                Err(format!("no root but size is {}", self.size))
            };
        };
        if self.node(root).parent.is_some() {
            return Err("root has a parent".to_string());
        }

        let mut leaf_count = 0usize;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.left.is_none() && node.right.is_none() {
                return Err(format!("node {} has two empty sides", id.0));
            }
            if self.size > 1 && (node.left.is_none() || node.right.is_none()) {
                return Err(format!(
                    "node {} has an empty side in a tree of size {}",
                    id.0, self.size
                ));
            }
            for child in [node.left, node.right].into_iter().flatten() {
                match child {
                    Child::Leaf(l) => {
                        leaf_count += 1;
                        if self.leaf(l).node() != Some(id) {
                            return Err(format!(
                                "leaf {} back-pointer does not name node {}",
                                l.0, id.0
                            ));
                        }
                    }
                    Child::Node(n) => {
                        if self.node(n).parent != Some(id) {
                            return Err(format!(
                                "node {} parent pointer does not name node {}",
                                n.0, id.0
                            ));
                        }
                        stack.push(n);
                    }
                }
            }
        }
        if leaf_count != self.size {
            return Err(format!(
                "size is {} but {} leaves are reachable",
                self.size, leaf_count
            ));
        }
        Ok(())
    }

    // Arena plumbing

    pub(crate) fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: Option<NodeId>) {
        self.root = root;
    }

    pub(crate) fn alloc_leaf(&mut self, leaf: ChemPoint) -> LeafId {
        match self.leaf_free.pop() {
            Some(i) => {
                self.leaves[i] = Some(leaf);
                LeafId(i)
            }
            None => {
                self.leaves.push(Some(leaf));
                LeafId(self.leaves.len() - 1)
            }
        }
    }

    fn free_leaf(&mut self, id: LeafId) {
        let slot = self.leaves[id.0].take();
        assert!(slot.is_some(), "double free of leaf handle");
        self.leaf_free.push(id.0);
    }

    pub(crate) fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.node_free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                NodeId(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn free_node(&mut self, id: NodeId) {
        let slot = self.nodes[id.0].take();
        assert!(slot.is_some(), "double free of node handle");
        self.node_free.push(id.0);
    }

    /// Drop every node while keeping the leaves, in preparation for a
    /// rebuild.
    pub(crate) fn drop_all_nodes(&mut self) {
        self.nodes.clear();
        self.node_free.clear();
        self.root = None;
        for slot in self.leaves.iter_mut().flatten() {
            slot.set_node(None);
        }
    }

    /// The occupied slot of `me`'s sibling within node `z`.
    fn other_side(&self, z: NodeId, me: Child) -> Child {
        let node = self.node(z);
        match node.side_of(me) {
            Some(false) => node.right.expect("node with two empty sides"),
            Some(true) => node.left.expect("node with two empty sides"),
            None => panic!("back-pointer names a node that does not hold the child"),
        }
    }

    /// Sibling of a leaf if that sibling is itself a leaf.
    pub(crate) fn leaf_sibling_of_leaf(&self, x: LeafId) -> Option<LeafId> {
        if self.size <= 1 {
            return None;
        }
        let z = self.leaf(x).node()?;
        match self.other_side(z, Child::Leaf(x)) {
            Child::Leaf(s) => Some(s),
            Child::Node(_) => None,
        }
    }

    /// Sibling of a leaf if that sibling is a node.
    pub(crate) fn node_sibling_of_leaf(&self, x: LeafId) -> Option<NodeId> {
        if self.size <= 1 {
            return None;
        }
        let z = self.leaf(x).node()?;
        match self.other_side(z, Child::Leaf(x)) {
            Child::Node(n) => Some(n),
            Child::Leaf(_) => None,
        }
    }

    /// Sibling of a node within its parent, if that sibling is a leaf.
    pub(crate) fn leaf_sibling_of_node(&self, y: NodeId) -> Option<LeafId> {
        let p = self.node(y).parent?;
        match self.other_side(p, Child::Node(y)) {
            Child::Leaf(s) => Some(s),
            Child::Node(_) => None,
        }
    }

    /// Sibling of a node within its parent, if that sibling is a node.
    pub(crate) fn node_sibling_of_node(&self, y: NodeId) -> Option<NodeId> {
        let p = self.node(y).parent?;
        match self.other_side(p, Child::Node(y)) {
            Child::Node(n) => Some(n),
            Child::Leaf(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn test_config() -> IsatConfig {
        IsatConfig::new(1, 1e-3, 64)
    }

    fn leaf_at(phi: Vec<f64>) -> ChemPoint {
        let n = phi.len();
        let phi = DVector::from_vec(phi);
        let jac = DMatrix::from_diagonal(&DVector::from_element(n, 0.1));
        let r_phi = &jac * &phi;
        ChemPoint::new(
            phi,
            r_phi,
            &jac,
            DVector::from_element(n, 1.0),
            1e-3,
            0.0,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_sizes_and_invariants() {
        let mut tree = BinaryTree::new(&test_config());
        assert_eq!(tree.size(), 0);
        assert!(tree.validate_structure().is_ok());

        tree.insert(leaf_at(vec![0.0, 0.0, 0.0]), None);
        assert_eq!(tree.size(), 1);
        assert!(tree.validate_structure().is_ok());

        tree.insert(leaf_at(vec![1.0, 0.0, 0.0]), None);
        assert_eq!(tree.size(), 2);
        assert_eq!(tree.depth(), 1);
        assert!(tree.validate_structure().is_ok());

        tree.insert(leaf_at(vec![2.0, 0.0, 0.0]), None);
        assert_eq!(tree.size(), 3);
        assert!(tree.validate_structure().is_ok());
    }

    #[test]
    fn test_delete_down_to_empty() {
        let mut tree = BinaryTree::new(&test_config());
        let a = tree.insert(leaf_at(vec![0.0, 0.0, 0.0]), None);
        let b = tree.insert(leaf_at(vec![1.0, 0.0, 0.0]), None);
        let c = tree.insert(leaf_at(vec![2.0, 0.0, 0.0]), None);

        tree.delete_leaf(b);
        assert_eq!(tree.size(), 2);
        assert!(tree.validate_structure().is_ok());

        tree.delete_leaf(a);
        assert_eq!(tree.size(), 1);
        assert!(tree.validate_structure().is_ok());

        tree.delete_leaf(c);
        assert_eq!(tree.size(), 0);
        assert!(tree.validate_structure().is_ok());

        // The tree must accept inserts again.
        tree.insert(leaf_at(vec![0.5, 0.0, 0.0]), None);
        assert_eq!(tree.size(), 1);
        assert!(tree.validate_structure().is_ok());
    }

    #[test]
    fn test_delete_sibling_node_transplants() {
        let mut tree = BinaryTree::new(&test_config());
        let a = tree.insert(leaf_at(vec![0.0, 0.0, 0.0]), None);
        let _b = tree.insert(leaf_at(vec![1.0, 0.0, 0.0]), None);
        let _c = tree.insert(leaf_at(vec![1.1, 0.0, 0.0]), None);

        // a's sibling is now the node holding b and c; deleting a must
        // transplant that node into the root position.
        tree.delete_leaf(a);
        assert_eq!(tree.size(), 2);
        assert_eq!(tree.depth(), 1);
        assert!(tree.validate_structure().is_ok());
    }

    #[test]
    fn test_in_order_traversal_visits_every_leaf() {
        let mut tree = BinaryTree::new(&test_config());
        let mut inserted = Vec::new();
        for i in 0..7 {
            inserted.push(tree.insert(leaf_at(vec![i as f64 * 0.3, 0.2, 0.0]), None));
        }
        let mut visited = tree.in_order_leaves();
        assert_eq!(visited.len(), 7);
        visited.sort_by_key(|id| id.0);
        inserted.sort_by_key(|id| id.0);
        assert_eq!(visited, inserted);
    }

    #[test]
    fn test_clear_resets() {
        let mut tree = BinaryTree::new(&test_config());
        for i in 0..5 {
            tree.insert(leaf_at(vec![i as f64, 0.0, 0.0]), None);
        }
        tree.clear();
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.depth(), 0);
        assert!(tree.validate_structure().is_ok());
        tree.insert(leaf_at(vec![0.0, 0.0, 0.0]), None);
        assert_eq!(tree.size(), 1);
    }
}
