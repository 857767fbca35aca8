//! Tabulation controller.
//!
//! One [`IsatCache`] owns the partition tree, the MRU fallback list,
//! the cleaning policy, and the chemistry solver it shields. A query
//! runs the decision ladder
//!
//! 1. primary retrieve (tree descent + EOA test)
//! 2. secondary retrieve (bounded sibling probing, optional)
//! 3. MRU retrieve (recent-hit scan, optional)
//! 4. direct integration, then grow the nearest ellipsoid if the
//!    linear model is confirmed there
//! 5. otherwise tabulate a new leaf, or request cleaning when full
//!
//! Every operation runs to completion before returning; the cache is
//! built for exclusive per-thread use and holds no in-flight state
//! between public calls.

mod mru;

pub use mru::MruList;

use std::fmt;

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::chemistry::ChemistrySolver;
use crate::ellipsoid::ChemPoint;
use crate::reduction::{MechanismReducer, ReducedState};
use crate::tree::{BinaryTree, LeafId};
use crate::{pack_phi, IsatConfig, IsatError};

/// Read-only cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Stored leaves.
    pub size: usize,
    /// Tree depth.
    pub depth: usize,
    /// Queries answered by retrieval.
    pub tot_retrieve: u64,
    /// Retrieves that needed the secondary search or the MRU list after
    /// a failed primary test.
    pub n_failed_first: u64,
    /// Queries answered by growing an existing ellipsoid.
    pub n_grow: u64,
    /// Queries answered by tabulating a new leaf.
    pub n_add: u64,
    /// Queries answered by direct integration alone (cache full or
    /// degenerate entry).
    pub n_direct: u64,
}

impl CacheStats {
    /// Total queries accounted for.
    pub fn total_queries(&self) -> u64 {
        self.tot_retrieve + self.n_grow + self.n_add + self.n_direct
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "leaves:            {:>10}", self.size)?;
        writeln!(f, "depth:             {:>10}", self.depth)?;
        writeln!(f, "retrieves:         {:>10}", self.tot_retrieve)?;
        writeln!(f, "  past primary:    {:>10}", self.n_failed_first)?;
        writeln!(f, "grows:             {:>10}", self.n_grow)?;
        writeln!(f, "adds:              {:>10}", self.n_add)?;
        write!(f, "direct evals:      {:>10}", self.n_direct)
    }
}

/// In-situ adaptive tabulation cache around a chemistry solver.
pub struct IsatCache<C: ChemistrySolver> {
    chemistry: C,
    reducer: Option<Box<dyn MechanismReducer>>,
    config: IsatConfig,
    tree: BinaryTree,
    mru: MruList,
    to_remove: Vec<LeafId>,
    rng: StdRng,

    cleaning_required: bool,
    current_time: f64,
    previous_time: f64,

    tot_retrieve: u64,
    n_failed_first: u64,
    n_grow: u64,
    n_add: u64,
    n_direct: u64,
}

impl<C: ChemistrySolver> IsatCache<C> {
    /// Create a cache from a validated configuration and the solver it
    /// will shield.
    pub fn new(config: IsatConfig, chemistry: C) -> Result<Self, IsatError> {
        config.validate()?;
        if chemistry.n_species() != config.n_species() {
            return Err(IsatError::InvalidConfig(format!(
                "solver integrates {} species but the configuration is sized for {}",
                chemistry.n_species(),
                config.n_species()
            )));
        }
        let tree = BinaryTree::new(&config);
        let mru = MruList::new(config.mru_size);
        let rng = StdRng::seed_from_u64(config.rng_seed);
        Ok(Self {
            chemistry,
            reducer: None,
            config,
            tree,
            mru,
            to_remove: Vec::new(),
            rng,
            cleaning_required: false,
            current_time: 0.0,
            previous_time: 0.0,
            tot_retrieve: 0,
            n_failed_first: 0,
            n_grow: 0,
            n_add: 0,
            n_direct: 0,
        })
    }

    /// Attach a mechanism reducer. New tabulation entries are built in
    /// the reduced subspace it reports.
    pub fn with_reducer(mut self, reducer: Box<dyn MechanismReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    /// Map one composition state, retrieving from the table whenever an
    /// ellipsoid of accuracy covers it.
    pub fn query(
        &mut self,
        mass_fractions: &[f64],
        temperature: f64,
        pressure: f64,
    ) -> Result<DVector<f64>, IsatError> {
        let phi_q = pack_phi(mass_fractions, temperature, pressure);
        self.query_vector(&phi_q)
    }

    /// [`IsatCache::query`] on an already packed composition vector.
    pub fn query_vector(&mut self, phi_q: &DVector<f64>) -> Result<DVector<f64>, IsatError> {
        if phi_q.len() != self.config.n_eq() {
            return Err(IsatError::DimensionMismatch {
                expected: self.config.n_eq(),
                got: phi_q.len(),
            });
        }
        if !phi_q.iter().all(|x| x.is_finite()) {
            return Err(IsatError::NonFiniteComposition);
        }

        // Housekeeping between queries.
        if self.config.clean && (self.cleaning_required || self.sweep_due()) {
            self.clean_and_balance();
        }

        // 1. Primary retrieve.
        let candidate = self.tree.primary_search(phi_q);
        if let Some(c0) = candidate {
            if self.tree.leaf(c0).in_eoa(phi_q) {
                return Ok(self.retrieve_from(c0, phi_q, false));
            }

            // 2. Secondary retrieve.
            if self.config.max_2nd_search > 0 {
                if let Some(hit) = self.tree.secondary_search(phi_q, c0) {
                    return Ok(self.retrieve_from(hit, phi_q, true));
                }
            }

            // 3. MRU retrieve.
            if self.mru.enabled() {
                let hit = self.mru.iter().find(|&id| self.tree.leaf(id).in_eoa(phi_q));
                if let Some(hit) = hit {
                    return Ok(self.retrieve_from(hit, phi_q, true));
                }
            }
        }

        // 4. Direct integration.
        let mapping = self.chemistry.compute(phi_q)?;

        // Grow the nearest ellipsoid if the linear model holds there.
        if let Some(c0) = candidate {
            if self.tree.leaf_mut(c0).check_solution(phi_q, &mapping.r_phi) {
                let time = self.current_time;
                let leaf = self.tree.leaf_mut(c0);
                leaf.grow(phi_q);
                leaf.touch(time);
                self.n_grow += 1;
                return Ok(mapping.r_phi);
            }
        }

        // 5. Tabulate, or fall back to the direct result.
        if self.tree.is_full() {
            self.cleaning_required = true;
            self.n_direct += 1;
            return Ok(mapping.r_phi);
        }
        let reduction = self.reduce_for(phi_q);
        match ChemPoint::new(
            phi_q.clone(),
            mapping.r_phi.clone(),
            &mapping.jacobian,
            self.config.scale_factor.clone(),
            self.config.tolerance,
            self.current_time,
            reduction,
            self.config.inert_index,
        ) {
            Ok(leaf) => {
                self.tree.insert(leaf, candidate);
                self.n_add += 1;
            }
            Err(IsatError::DegenerateEntry(_)) => {
                // Numerical degeneracy never blocks the answer and
                // never touches the tree.
                self.n_direct += 1;
            }
            Err(other) => return Err(other),
        }
        Ok(mapping.r_phi)
    }

    /// Interpolate from a covering leaf and account the retrieve.
    fn retrieve_from(&mut self, id: LeafId, phi_q: &DVector<f64>, past_primary: bool) -> DVector<f64> {
        let time = self.current_time;
        let leaf = self.tree.leaf_mut(id);
        let result = leaf.interpolate(phi_q);
        leaf.record_use(time);
        self.mru.touch(id);
        self.tot_retrieve += 1;
        if past_primary {
            self.n_failed_first += 1;
        }
        result
    }

    fn reduce_for(&mut self, phi_q: &DVector<f64>) -> Option<ReducedState> {
        let reducer = self.reducer.as_mut()?;
        if !reducer.online() {
            return None;
        }
        let n_species = self.config.n_species();
        let c = DVector::from_fn(n_species, |i, _| phi_q[i]);
        Some(reducer.reduce_mechanism(&c, phi_q[n_species], phi_q[n_species + 1]))
    }

    /// Sweep every leaf, evict the stale ones, and rebuild the tree
    /// shape if its triggers fire. Returns whether anything changed.
    ///
    /// Runs automatically between queries once requested or on the
    /// configured schedule; hosts may also call it explicitly, e.g. at
    /// the end of a timestep.
    pub fn clean_and_balance(&mut self) -> bool {
        let mut modified = false;

        if self.config.clean {
            for (id, leaf) in self.tree.iter() {
                let idle = self.current_time - leaf.last_time_used();
                let age = self.current_time - leaf.time_tag();
                let overused = self.config.check_used.is_some_and(|t| leaf.n_used() > t);
                let overgrown = self.config.check_grown.is_some_and(|t| leaf.n_grown() > t);
                if idle > self.config.chp_max_use_interval
                    || age > self.config.chp_max_life_time
                    || overused
                    || overgrown
                {
                    self.to_remove.push(id);
                }
            }
            for id in std::mem::take(&mut self.to_remove) {
                self.mru.remove(id);
                self.tree.delete_leaf(id);
                modified = true;
            }
        }
        self.previous_time = self.current_time;
        self.cleaning_required = false;

        modified | self.maybe_balance()
    }

    fn maybe_balance(&mut self) -> bool {
        let size = self.tree.size();
        if size <= self.config.min_balance_threshold || size < 2 {
            return false;
        }
        let depth_bound = self.config.max_depth_factor * (size as f64).log2();
        let stressed = self.tot_retrieve > 0
            && (self.n_failed_first as f64) / (self.tot_retrieve as f64)
                > self.config.max_2nd_ret_balance;
        if self.tree.is_full() || (self.tree.depth() as f64) > depth_bound || stressed {
            return self.tree.balance(&mut self.rng);
        }
        false
    }

    fn sweep_due(&self) -> bool {
        self.current_time - self.previous_time > self.config.check_entire_tree_interval
    }

    /// Advance the simulation clock.
    pub fn advance_time(&mut self, dt: f64) {
        self.current_time += dt;
    }

    /// Set the simulation clock.
    pub fn set_time(&mut self, time: f64) {
        self.current_time = time;
    }

    /// Current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// Drop every tabulated point and reset the tree; counters and the
    /// clock are kept.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.mru.clear();
        self.to_remove.clear();
        self.cleaning_required = false;
    }

    /// Number of stored leaves.
    pub fn size(&self) -> usize {
        self.tree.size()
    }

    /// Depth of the partition tree.
    pub fn depth(&self) -> usize {
        self.tree.depth()
    }

    /// Is a cleaning pass pending?
    pub fn cleaning_required(&self) -> bool {
        self.cleaning_required
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.tree.size(),
            depth: self.tree.depth(),
            tot_retrieve: self.tot_retrieve,
            n_failed_first: self.n_failed_first,
            n_grow: self.n_grow,
            n_add: self.n_add,
            n_direct: self.n_direct,
        }
    }

    /// The partition tree, read-only.
    pub fn tree(&self) -> &BinaryTree {
        &self.tree
    }

    /// The wrapped solver, read-only.
    pub fn chemistry(&self) -> &C {
        &self.chemistry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chemistry::LinearChemistry;
    use nalgebra::DMatrix;

    fn linear_cache(max_elements: usize) -> IsatCache<LinearChemistry> {
        let m = DMatrix::from_diagonal(&DVector::from_element(3, 0.1));
        let b = DVector::zeros(3);
        let config = IsatConfig::new(1, 1e-3, max_elements);
        IsatCache::new(config, LinearChemistry::new(m, b)).unwrap()
    }

    #[test]
    fn test_first_query_adds_then_retrieves() {
        let mut cache = linear_cache(16);
        let phi = DVector::from_vec(vec![0.0, 0.0, 0.0]);

        let first = cache.query_vector(&phi).unwrap();
        assert_eq!(cache.stats().n_add, 1);
        assert_eq!(cache.size(), 1);

        let second = cache.query_vector(&phi).unwrap();
        assert_eq!(cache.stats().tot_retrieve, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_linear_miss_grows_instead_of_adding() {
        let mut cache = linear_cache(16);
        cache
            .query_vector(&DVector::from_vec(vec![0.0, 0.0, 0.0]))
            .unwrap();

        // Far outside the initial ellipsoid, but the model is exactly
        // linear, so the solution check passes and the leaf grows.
        cache
            .query_vector(&DVector::from_vec(vec![5.0, 5.0, 5.0]))
            .unwrap();
        assert_eq!(cache.stats().n_grow, 1);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_full_cache_requests_cleaning() {
        let m = DMatrix::from_diagonal(&DVector::from_element(3, 0.1));
        let b = DVector::zeros(3);
        let c = DVector::from_element(3, 1.0);
        let mut config = IsatConfig::new(1, 1e-3, 1);
        // Keep housekeeping out of the way so the flag is observable.
        config.clean = false;
        let mut cache =
            IsatCache::new(config, crate::chemistry::QuadraticChemistry::new(m, b, c)).unwrap();

        cache
            .query_vector(&DVector::from_vec(vec![0.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(cache.size(), 1);

        // Curvature defeats the solution check far away; the tree is
        // full, so the query is answered directly.
        cache
            .query_vector(&DVector::from_vec(vec![3.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(cache.size(), 1);
        assert!(cache.cleaning_required());
        assert_eq!(cache.stats().n_direct, 1);
    }

    #[test]
    fn test_rejects_wrong_dimension_and_nan() {
        let mut cache = linear_cache(16);
        let short = DVector::from_vec(vec![0.0, 0.0]);
        assert!(matches!(
            cache.query_vector(&short),
            Err(IsatError::DimensionMismatch { .. })
        ));

        let mut bad = DVector::zeros(3);
        bad[2] = f64::INFINITY;
        assert!(matches!(
            cache.query_vector(&bad),
            Err(IsatError::NonFiniteComposition)
        ));
    }

    #[test]
    fn test_clear_then_insert() {
        let mut cache = linear_cache(16);
        cache
            .query_vector(&DVector::from_vec(vec![0.0, 0.0, 0.0]))
            .unwrap();
        cache.clear();
        assert_eq!(cache.size(), 0);

        cache
            .query_vector(&DVector::from_vec(vec![1.0, 1.0, 1.0]))
            .unwrap();
        assert_eq!(cache.size(), 1);
        assert!(cache.tree().validate_structure().is_ok());
    }
}
