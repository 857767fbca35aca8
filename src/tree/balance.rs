//! Tree rebuild.
//!
//! Incremental insertion tied to query order degrades the tree towards
//! list shape; deletions make it worse. The rebuild separates the leaf
//! population with a hyperplane perpendicular to a high-variance
//! composition direction, seeds the new root with the two extreme
//! leaves along it, and reinserts the remainder in random order. Random
//! order is what keeps the expected depth at O(log n): reinserting the
//! leaves sorted along the split direction would rebuild the very chain
//! the rebuild exists to remove.

use rand::seq::SliceRandom;
use rand::rngs::StdRng;

use super::{BinaryTree, Node};

impl BinaryTree {
    /// Rebuild the node structure above the current leaves.
    ///
    /// Keeps every leaf and its data untouched; only the topology
    /// changes. Returns `false` when the tree is too small to bother.
    pub fn balance(&mut self, rng: &mut StdRng) -> bool {
        if self.size() <= self.min_balance_threshold || self.size() < 2 {
            return false;
        }

        let ids = self.in_order_leaves();
        let n_eq = self.leaf(ids[0]).phi().len();
        let size = ids.len() as f64;

        // Mean and per-direction variance of the stored compositions.
        let mut mean = vec![0.0; n_eq];
        for &id in &ids {
            let phi = self.leaf(id).phi();
            for (m, &x) in mean.iter_mut().zip(phi.iter()) {
                *m += x;
            }
        }
        for m in mean.iter_mut() {
            *m /= size;
        }
        let mut variance = vec![0.0; n_eq];
        for &id in &ids {
            let phi = self.leaf(id).phi();
            for (v, (&x, &m)) in variance.iter_mut().zip(phi.iter().zip(mean.iter())) {
                *v += (x - m) * (x - m);
            }
        }

        // Try split directions in decreasing variance order. Accept the
        // first one whose below-mean count lands inside the balance
        // window, otherwise keep the best seen.
        let mut directions: Vec<usize> = (0..n_eq).collect();
        directions.sort_by(|&a, &b| variance[b].partial_cmp(&variance[a]).unwrap());

        let lo = self.balance_prop * size;
        let hi = (1.0 - self.balance_prop) * size;
        let mut split_dir = directions[0];
        let mut best_offset = f64::INFINITY;
        let mut nb_left = 0usize;
        let mut nb_tests = 0usize;
        while ((nb_left as f64) < lo || (nb_left as f64) > hi)
            && nb_tests < self.max_nb_balance_test
            && nb_tests < n_eq - 1
        {
            let dir = directions[nb_tests];
            nb_tests += 1;
            nb_left = ids
                .iter()
                .filter(|&&id| self.leaf(id).phi()[dir] < mean[dir])
                .count();
            let offset = (nb_left as f64 - size * 0.5).abs();
            if offset < best_offset {
                best_offset = offset;
                split_dir = dir;
            }
        }

        // The two extreme leaves along the split direction anchor the
        // new root.
        let mut min_id = ids[0];
        let mut max_id = ids[0];
        let mut min_phi = f64::INFINITY;
        let mut max_phi = f64::NEG_INFINITY;
        for &id in &ids {
            let value = self.leaf(id).phi()[split_dir];
            if value < min_phi {
                min_phi = value;
                min_id = id;
            }
            if value > max_phi {
                max_phi = value;
                max_id = id;
            }
        }
        if min_id == max_id {
            // Degenerate population collapsed onto one point along
            // every tried direction; keep the current shape.
            return false;
        }

        self.drop_all_nodes();
        let root = Node::between(
            self.leaf(min_id),
            min_id,
            self.leaf(max_id),
            max_id,
            None,
        );
        let root_id = self.alloc_node(root);
        self.set_root(Some(root_id));
        self.leaf_mut(min_id).set_node(Some(root_id));
        self.leaf_mut(max_id).set_node(Some(root_id));

        // Random reinsertion of the remaining leaves.
        let mut order = ids;
        order.shuffle(rng);
        for id in order {
            if id == min_id || id == max_id {
                continue;
            }
            let phi = self.leaf(id).phi().clone();
            let nearest = self
                .primary_search(&phi)
                .expect("rebuild root always yields a candidate");
            self.splice(nearest, id);
        }
        true
    }
}
