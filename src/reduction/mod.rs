//! Mechanism-reduction interface.
//!
//! A reducer classifies species as active or inactive for one query
//! state, shrinking the subspace in which the ellipsoid algebra runs
//! from `n_species + 2` down to `n_active + 2`. The cache only consumes
//! the resulting mask and index maps; how a reducer ranks species
//! (error-propagation graphs, directed relation graphs, ...) is its own
//! business.

use nalgebra::DVector;

/// Active-species classification for one query, with the index maps
/// between the complete and the simplified mechanism.
///
/// Temperature and pressure are always retained; the maps cover species
/// only. A leaf tabulated under a reduction keeps its own copy, so
/// later queries are tested in the subspace the leaf was built in.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedState {
    /// Per-species activity flags, length `n_species`.
    pub active: Vec<bool>,

    /// For each complete-mechanism species, its index in the simplified
    /// mechanism, or `None` when inactive.
    pub complete_to_simplified: Vec<Option<usize>>,

    /// For each simplified-mechanism species, its index in the complete
    /// mechanism.
    pub simplified_to_complete: Vec<usize>,
}

impl ReducedState {
    /// Build the index maps from an activity mask.
    pub fn from_mask(active: &[bool]) -> Self {
        let mut complete_to_simplified = vec![None; active.len()];
        let mut simplified_to_complete = Vec::new();
        for (i, &flag) in active.iter().enumerate() {
            if flag {
                complete_to_simplified[i] = Some(simplified_to_complete.len());
                simplified_to_complete.push(i);
            }
        }
        Self {
            active: active.to_vec(),
            complete_to_simplified,
            simplified_to_complete,
        }
    }

    /// Number of active species.
    pub fn n_active(&self) -> usize {
        self.simplified_to_complete.len()
    }

    /// Number of species in the complete mechanism.
    pub fn n_species(&self) -> usize {
        self.active.len()
    }
}

/// Pre-filter narrowing the active composition subspace for a query.
///
/// Implementations are queried once per cache miss, before a new leaf
/// is tabulated. They must be pure per query: the cache may call
/// [`MechanismReducer::reduce_mechanism`] at any point between its own
/// public operations.
pub trait MechanismReducer {
    /// Classify species for the state (c, T, p) and return the mask and
    /// index maps to tabulate under.
    fn reduce_mechanism(&mut self, c: &DVector<f64>, temperature: f64, pressure: f64)
        -> ReducedState;

    /// Activity flags from the most recent reduction.
    fn active_species(&self) -> &[bool];

    /// Number of species retained by the most recent reduction.
    fn n_simplified(&self) -> usize;

    /// Tolerance the reducer applies when ranking species.
    fn eps_dac(&self) -> f64;

    /// Species seeding the reachability search (fuel, oxidiser, ...).
    fn search_init_set(&self) -> &[usize];

    /// Whether reduction is switched on. A reducer reporting `false` is
    /// ignored and the cache tabulates in the full space.
    fn online(&self) -> bool;
}

/// Reducer with a fixed activity mask.
///
/// Stands in for a real reduction scheme in tests and in hosts that
/// know the relevant sub-mechanism ahead of time.
#[derive(Debug, Clone)]
pub struct StaticReducer {
    state: ReducedState,
    eps_dac: f64,
    search_init_set: Vec<usize>,
    online: bool,
}

impl StaticReducer {
    /// Create a reducer that always reports `active` as the mask.
    pub fn new(active: Vec<bool>) -> Self {
        let state = ReducedState::from_mask(&active);
        Self {
            state,
            eps_dac: 1e-2,
            search_init_set: Vec::new(),
            online: true,
        }
    }

    /// Override the reported reduction tolerance.
    pub fn with_eps_dac(mut self, eps_dac: f64) -> Self {
        self.eps_dac = eps_dac;
        self
    }

    /// Override the reported search-initiating species.
    pub fn with_search_init_set(mut self, set: Vec<usize>) -> Self {
        self.search_init_set = set;
        self
    }
}

impl MechanismReducer for StaticReducer {
    fn reduce_mechanism(
        &mut self,
        _c: &DVector<f64>,
        _temperature: f64,
        _pressure: f64,
    ) -> ReducedState {
        self.state.clone()
    }

    fn active_species(&self) -> &[bool] {
        &self.state.active
    }

    fn n_simplified(&self) -> usize {
        self.state.n_active()
    }

    fn eps_dac(&self) -> f64 {
        self.eps_dac
    }

    fn search_init_set(&self) -> &[usize] {
        &self.search_init_set
    }

    fn online(&self) -> bool {
        self.online
    }
}
