//! Internal vertex of the partition tree.
//!
//! A node separates the composition space between its two descendant
//! points with a hyperplane { φ : vᵀ·φ = a }. In the frame where the
//! left point's ellipsoid is the unit ball, the plane is the
//! perpendicular bisector of the segment joining the two points; mapped
//! back it gives
//!
//! ```text
//! v = L·Lᵀ·(φ_R − φ_L),    a = vᵀ·(φ_L + φ_R)/2
//! ```
//!
//! with L taken from the left leaf. v is left unnormalised; only the
//! sign of vᵀ·φ − a matters for travel.

use nalgebra::DVector;

use crate::ellipsoid::ChemPoint;

/// Handle of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Handle of a leaf in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafId(pub(crate) usize);

/// One side of a node: either a deeper node or a stored leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    /// Subtree root.
    Node(NodeId),
    /// Tabulated point.
    Leaf(LeafId),
}

/// Internal partition vertex.
///
/// With two or more leaves in the tree every reachable node has both
/// sides occupied and a valid hyperplane. The single exception is the
/// placeholder root of a one-leaf tree, which holds its leaf in the
/// left slot and is never travelled through.
#[derive(Debug, Clone)]
pub struct Node {
    /// Left side, holding the previously stored point at creation.
    pub(crate) left: Option<Child>,

    /// Right side, holding the newly added point at creation.
    pub(crate) right: Option<Child>,

    /// Containing node, `None` for the root.
    pub(crate) parent: Option<NodeId>,

    /// Hyperplane normal, complete space, unnormalised.
    pub(crate) v: DVector<f64>,

    /// Hyperplane offset.
    pub(crate) a: f64,
}

impl Node {
    /// Placeholder without a hyperplane, used as the root of a one-leaf
    /// tree.
    pub(crate) fn placeholder(leaf: LeafId) -> Self {
        Self {
            left: Some(Child::Leaf(leaf)),
            right: None,
            parent: None,
            v: DVector::zeros(0),
            a: 0.0,
        }
    }

    /// Build a separating node from two leaves.
    pub(crate) fn between(
        left_leaf: &ChemPoint,
        left_id: LeafId,
        right_leaf: &ChemPoint,
        right_id: LeafId,
        parent: Option<NodeId>,
    ) -> Self {
        let v = Self::calc_v(left_leaf, right_leaf);
        let a = Self::calc_a(&v, left_leaf, right_leaf);
        Self {
            left: Some(Child::Leaf(left_id)),
            right: Some(Child::Leaf(right_id)),
            parent,
            v,
            a,
        }
    }

    /// Hyperplane normal v = L·Lᵀ·(φ_R − φ_L) through the left leaf's
    /// ellipsoid metric.
    ///
    /// When the left leaf was tabulated under a reduction the metric is
    /// only defined on its working space; inactive dimensions fall back
    /// to the raw difference.
    pub(crate) fn calc_v(left: &ChemPoint, right: &ChemPoint) -> DVector<f64> {
        let n_eq = left.n_eq();
        let lt = left.lt();
        match left.reduction() {
            None => {
                let d = right.phi() - left.phi();
                lt.transpose() * (lt * &d)
            }
            Some(red) => {
                let d_red = left.model_diff(right.phi());
                let w_red = lt.transpose() * (lt * &d_red);
                let mut v = DVector::zeros(n_eq);
                for (row, &ci) in left.active_index().iter().enumerate() {
                    v[ci] = w_red[row];
                }
                for (ci, &flag) in red.active.iter().enumerate() {
                    if !flag {
                        v[ci] = right.phi()[ci] - left.phi()[ci];
                    }
                }
                v
            }
        }
    }

    /// Hyperplane offset a = vᵀ·(φ_L + φ_R)/2.
    pub(crate) fn calc_a(v: &DVector<f64>, left: &ChemPoint, right: &ChemPoint) -> f64 {
        let mid = (left.phi() + right.phi()) * 0.5;
        v.dot(&mid)
    }

    /// Which side of the hyperplane does a query fall on?
    /// `true` means the right side, where the newer point went.
    pub(crate) fn goes_right(&self, phi_q: &DVector<f64>) -> bool {
        self.v.dot(phi_q) > self.a
    }

    /// The slot currently holding `child`, if any: `false` for left,
    /// `true` for right.
    pub(crate) fn side_of(&self, child: Child) -> Option<bool> {
        if self.left == Some(child) {
            Some(false)
        } else if self.right == Some(child) {
            Some(true)
        } else {
            None
        }
    }

    /// Replace whichever slot holds `old` with `new`.
    pub(crate) fn replace_child(&mut self, old: Child, new: Child) {
        match self.side_of(old) {
            Some(false) => self.left = Some(new),
            Some(true) => self.right = Some(new),
            None => panic!("child to replace not present in node"),
        }
    }

    /// Hyperplane normal.
    pub fn v(&self) -> &DVector<f64> {
        &self.v
    }

    /// Hyperplane offset.
    pub fn a(&self) -> f64 {
        self.a
    }
}
