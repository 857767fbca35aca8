//! Primary and secondary tree search.
//!
//! The primary search walks hyperplanes from the root and returns the
//! geometrically best leaf without touching any EOA; containment is the
//! caller's test. The secondary search runs after a failed primary
//! test: it climbs from the failed leaf and probes sibling subtrees,
//! spending at most `max_2nd_search` leaf EOA tests. The test counter
//! is reset only at the top-level entry and is shared across the whole
//! descent, so nested probes drain the same budget.

use nalgebra::DVector;

use super::{BinaryTree, Child, LeafId, NodeId};

impl BinaryTree {
    /// Hyperplane descent to the best geometric candidate.
    ///
    /// O(depth), no EOA tests. Returns `None` only on an empty tree.
    pub fn primary_search(&self, phi_q: &DVector<f64>) -> Option<LeafId> {
        let root = self.root()?;
        if self.size() == 1 {
            return match self.node(root).left {
                Some(Child::Leaf(l)) => Some(l),
                _ => panic!("one-leaf tree must hold its leaf in the left root slot"),
            };
        }

        let mut current = root;
        loop {
            let node = self.node(current);
            let side = if node.goes_right(phi_q) {
                node.right
            } else {
                node.left
            };
            match side {
                Some(Child::Node(n)) => current = n,
                Some(Child::Leaf(l)) => return Some(l),
                None => panic!("node with an empty side in a populated tree"),
            }
        }
    }

    /// Climb from a leaf whose EOA test failed and probe the sibling
    /// subtrees for a covering ellipsoid.
    ///
    /// Returns the covering leaf, or `None` once the budget of
    /// `max_2nd_search` leaf tests is spent or every ancestor sibling
    /// has been ruled out.
    pub fn secondary_search(&mut self, phi_q: &DVector<f64>, x: LeafId) -> Option<LeafId> {
        self.n_2nd_search = 0;
        if self.max_2nd_search == 0 || self.size() <= 1 {
            return None;
        }

        // Sibling of the failed leaf itself.
        if let Some(xs) = self.leaf_sibling_of_leaf(x) {
            self.n_2nd_search += 1;
            if self.leaf(xs).in_eoa(phi_q) {
                return Some(xs);
            }
        } else if let Some(sub) = self.node_sibling_of_leaf(x) {
            if let Some(found) = self.in_sub_tree(phi_q, sub) {
                return Some(found);
            }
        }

        // Then the siblings of each ancestor in turn.
        let mut y = self.leaf(x).node().expect("tabulated leaf has a node");
        while self.node(y).parent.is_some() && self.n_2nd_search < self.max_2nd_search {
            if let Some(xs) = self.leaf_sibling_of_node(y) {
                self.n_2nd_search += 1;
                if self.leaf(xs).in_eoa(phi_q) {
                    return Some(xs);
                }
            } else if let Some(sub) = self.node_sibling_of_node(y) {
                if let Some(found) = self.in_sub_tree(phi_q, sub) {
                    return Some(found);
                }
            }
            y = self.node(y).parent.expect("loop condition checked parent");
        }
        None
    }

    /// Bounded walk of a subtree: follow the hyperplane towards the
    /// promising side first, then probe the other side, charging every
    /// leaf EOA test to the shared budget.
    fn in_sub_tree(&mut self, phi_q: &DVector<f64>, y: NodeId) -> Option<LeafId> {
        if self.n_2nd_search >= self.max_2nd_search {
            return None;
        }
        let (goes_right, left, right) = {
            let node = self.node(y);
            (node.goes_right(phi_q), node.left, node.right)
        };

        let (near, far) = if goes_right {
            (right, left)
        } else {
            (left, right)
        };

        match near.expect("node with an empty side in a populated tree") {
            Child::Leaf(l) => {
                self.n_2nd_search += 1;
                if self.leaf(l).in_eoa(phi_q) {
                    return Some(l);
                }
            }
            Child::Node(n) => {
                if let Some(found) = self.in_sub_tree(phi_q, n) {
                    return Some(found);
                }
            }
        }

        match far.expect("node with an empty side in a populated tree") {
            Child::Leaf(l) => {
                if self.n_2nd_search < self.max_2nd_search {
                    self.n_2nd_search += 1;
                    if self.leaf(l).in_eoa(phi_q) {
                        return Some(l);
                    }
                }
                None
            }
            Child::Node(n) => self.in_sub_tree(phi_q, n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ellipsoid::ChemPoint;
    use crate::IsatConfig;
    use nalgebra::{DMatrix, DVector};

    fn leaf_at(phi: Vec<f64>, jac_diag: f64) -> ChemPoint {
        let n = phi.len();
        let phi = DVector::from_vec(phi);
        let jac = DMatrix::from_diagonal(&DVector::from_element(n, jac_diag));
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
    fn test_primary_search_descends_to_nearest() {
        let mut config = IsatConfig::new(1, 1e-3, 64);
        config.max_2nd_search = 8;
        let mut tree = BinaryTree::new(&config);

        let a = tree.insert(leaf_at(vec![0.0, 0.0, 0.0], 0.1), None);
        let b = tree.insert(leaf_at(vec![1.0, 0.0, 0.0], 0.1), None);

        let near_a = DVector::from_vec(vec![0.1, 0.0, 0.0]);
        let near_b = DVector::from_vec(vec![0.9, 0.0, 0.0]);
        assert_eq!(tree.primary_search(&near_a), Some(a));
        assert_eq!(tree.primary_search(&near_b), Some(b));
    }

    #[test]
    fn test_primary_search_on_small_trees() {
        let config = IsatConfig::new(1, 1e-3, 64);
        let mut tree = BinaryTree::new(&config);
        let q = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        assert_eq!(tree.primary_search(&q), None);

        let only = tree.insert(leaf_at(vec![5.0, 5.0, 5.0], 0.1), None);
        assert_eq!(tree.primary_search(&q), Some(only));
    }

    #[test]
    fn test_secondary_search_disabled_without_budget() {
        let config = IsatConfig::new(1, 1e-3, 64);
        let mut tree = BinaryTree::new(&config);
        let a = tree.insert(leaf_at(vec![0.0, 0.0, 0.0], 0.1), None);
        let _b = tree.insert(leaf_at(vec![1.0, 0.0, 0.0], 0.1), None);

        let q = DVector::from_vec(vec![0.0, 0.001, 0.0]);
        assert_eq!(tree.secondary_search(&q, a), None);
        assert_eq!(tree.n_2nd_search(), 0);
    }

    #[test]
    fn test_secondary_search_finds_sibling_leaf() {
        let mut config = IsatConfig::new(1, 1e-3, 64);
        config.max_2nd_search = 8;
        let mut tree = BinaryTree::new(&config);

        // EOA radius 0.01 around each point.
        let a = tree.insert(leaf_at(vec![0.0, 0.0, 0.0], 0.1), None);
        let b = tree.insert(leaf_at(vec![1.0, 0.0, 0.0], 0.1), None);

        // Inside a's ellipsoid; pretend the primary descent failed at b.
        let q = DVector::from_vec(vec![0.002, 0.0, 0.0]);
        assert_eq!(tree.secondary_search(&q, b), Some(a));
        assert_eq!(tree.n_2nd_search(), 1);
    }

    #[test]
    fn test_secondary_search_respects_budget() {
        let mut config = IsatConfig::new(1, 1e-3, 64);
        config.max_2nd_search = 2;
        let mut tree = BinaryTree::new(&config);

        // A chain of far-apart points whose ellipsoids cannot cover q.
        let mut first = None;
        for i in 0..6 {
            let id = tree.insert(leaf_at(vec![i as f64 * 10.0, 0.0, 0.0], 0.1), None);
            first.get_or_insert(id);
        }
        let q = DVector::from_vec(vec![500.0, 500.0, 500.0]);
        let start = tree.primary_search(&q).unwrap();
        assert_eq!(tree.secondary_search(&q, start), None);
        assert!(tree.n_2nd_search() <= 2);
    }
}
