//! # In-Situ Adaptive Tabulation (ISAT)
//!
//! This library caches an expensive vector-valued mapping R: ℝⁿ → ℝⁿ,
//! the canonical client being stiff chemical-kinetics integration in a
//! reacting-flow solver. Every stored sample keeps, next to the input φ
//! and its image Rφ, the local Jacobian A = ∂Rφ/∂φ and an *ellipsoid of
//! accuracy* (EOA): the region around φ inside which the linear model
//!
//! ```text
//! Rφ_q ≈ Rφ + A·(φ_q − φ)
//! ```
//!
//! answers a query within the scaled tolerance ε.
//!
//! ## Query outcomes
//!
//! 1. **Retrieve**: a stored EOA covers φ_q, answer by interpolation
//! 2. **Grow**: the exact mapping confirms the linear model near a
//!    stored point, so its ellipsoid is inflated to include φ_q
//! 3. **Add**: a new sample is tabulated and spliced into the search tree
//!
//! Stored points are indexed by a binary space-partition tree whose
//! hyperplanes derive from the leaf ellipsoids, with an optional
//! secondary search and a most-recently-used fallback when the primary
//! descent lands in the wrong cell. Periodic cleaning evicts stale
//! leaves and a variance-directed rebuild keeps the depth near log₂(n).
//!
//! ## Usage example
//!
//! ```ignore
//! use isat::{IsatCache, IsatConfig};
//!
//! let config = IsatConfig::new(n_species, 1e-4, 10_000);
//! let mut cache = IsatCache::new(config, solver)?;
//! let r_phi = cache.query(&mass_fractions, temperature, pressure)?;
//! ```

#![warn(missing_docs)]
#![allow(clippy::new_without_default)]

// Core modules - each implements one component of the tabulation scheme
pub mod cache;      // Controller: retrieve/grow/add loop, cleaning policy
pub mod chemistry;  // Mapping source interface + synthetic models
pub mod ellipsoid;  // Tabulated leaf and its ellipsoid of accuracy
pub mod reduction;  // Mechanism-reduction interface (active species masks)
pub mod tree;       // Binary space-partition tree over stored leaves

// Re-exports for convenience
pub use cache::{CacheStats, IsatCache};
pub use chemistry::{ChemistrySolver, LinearChemistry, Mapping, QuadraticChemistry};
pub use ellipsoid::{ChemPoint, GrowOutcome};
pub use reduction::{MechanismReducer, ReducedState, StaticReducer};
pub use tree::{BinaryTree, LeafId, NodeId};

use nalgebra::DVector;
use thiserror::Error;

/// Configuration for one tabulation cache.
///
/// All tunables of the retrieval scheme live here so that independent
/// caches (one per thread or per mesh region) carry independent
/// tolerances. Construct with [`IsatConfig::new`] and override fields
/// as needed before handing the config to [`IsatCache::new`].
#[derive(Debug, Clone)]
pub struct IsatConfig {
    /// EOA error tolerance ε. Retrieval guarantees the scaled linear
    /// interpolation error stays below this value.
    pub tolerance: f64,

    /// Per-component scale factor, length `n_species + 2`. All distance
    /// and ellipsoid computations run on `B·x` with B = diag(1/scale).
    pub scale_factor: DVector<f64>,

    /// Maximum number of stored leaves before adds are refused and a
    /// cleaning pass is requested.
    pub max_elements: usize,

    /// Budget of leaf EOA tests for the secondary tree search.
    /// 0 disables the secondary search entirely.
    pub max_2nd_search: usize,

    /// Leaves required before a rebuild is considered.
    pub min_balance_threshold: usize,

    /// Cap on split-direction trials during a rebuild.
    pub max_nb_balance_test: usize,

    /// Minimum fraction of leaves that must land on each side of the
    /// rebuild hyperplane for a split direction to be accepted outright.
    pub balance_prop: f64,

    /// Enable the cleaning sweep between queries.
    pub clean: bool,

    /// Evict a leaf once its use counter passes this threshold.
    /// `None` disables the check.
    pub check_used: Option<u64>,

    /// Evict a leaf once its grow counter passes this threshold; a
    /// many-times-grown ellipsoid no longer reflects its Jacobian.
    /// `None` disables the check.
    pub check_grown: Option<u64>,

    /// Capacity of the most-recently-used retrieve list. 0 disables the
    /// MRU fallback scan.
    pub mru_size: usize,

    /// Simulation-time seconds between unconditional full-tree sweeps.
    pub check_entire_tree_interval: f64,

    /// Evict leaves older than this (simulation-time seconds).
    pub chp_max_life_time: f64,

    /// Evict leaves idle longer than this (simulation-time seconds).
    pub chp_max_use_interval: f64,

    /// Fraction of retrieves served past the primary search above which
    /// a rebuild is forced.
    pub max_2nd_ret_balance: f64,

    /// A rebuild triggers once depth exceeds this factor times
    /// log₂(size).
    pub max_depth_factor: f64,

    /// Seed for the rebuild shuffle. A fixed default keeps tree shapes
    /// and retrieval statistics reproducible run-to-run.
    pub rng_seed: u64,

    /// Index of an inert species excluded from EOA distance tests, if
    /// the mechanism carries one.
    pub inert_index: Option<usize>,
}

impl IsatConfig {
    /// Create a configuration for `n_species` species with unit scale
    /// factors and the standard defaults for everything but `tolerance`
    /// and `max_elements`.
    pub fn new(n_species: usize, tolerance: f64, max_elements: usize) -> Self {
        Self {
            tolerance,
            scale_factor: DVector::from_element(n_species + 2, 1.0),
            max_elements,
            max_2nd_search: 0,
            min_balance_threshold: max_elements / 10,
            max_nb_balance_test: (n_species / 100).max(1),
            balance_prop: 0.35,
            clean: true,
            check_used: None,
            check_grown: None,
            mru_size: 0,
            check_entire_tree_interval: f64::INFINITY,
            chp_max_life_time: f64::INFINITY,
            chp_max_use_interval: f64::INFINITY,
            max_2nd_ret_balance: 1.0,
            max_depth_factor: 2.0,
            rng_seed: 0x1547_ab1e,
            inert_index: None,
        }
    }

    /// Replace the scale factors. The vector length fixes the size of
    /// the composition space (`n_species + 2`).
    pub fn with_scale_factor(mut self, scale_factor: DVector<f64>) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Size of the composition space: species plus temperature and
    /// pressure.
    pub fn n_eq(&self) -> usize {
        self.scale_factor.len()
    }

    /// Number of species in the full mechanism.
    pub fn n_species(&self) -> usize {
        self.n_eq() - 2
    }

    /// Check the configuration for values that would poison every later
    /// computation.
    pub fn validate(&self) -> Result<(), IsatError> {
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(IsatError::InvalidConfig(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if self.n_eq() < 3 {
            return Err(IsatError::InvalidConfig(format!(
                "scale factor must cover at least one species plus T and p, got length {}",
                self.n_eq()
            )));
        }
        if self.scale_factor.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(IsatError::InvalidConfig(
                "scale factors must be positive and finite".to_string(),
            ));
        }
        if self.max_elements == 0 {
            return Err(IsatError::InvalidConfig(
                "max_elements must be at least 1".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.balance_prop) {
            return Err(IsatError::InvalidConfig(format!(
                "balance_prop must lie in [0, 0.5], got {}",
                self.balance_prop
            )));
        }
        if let Some(i) = self.inert_index {
            if i >= self.n_species() {
                return Err(IsatError::InvalidConfig(format!(
                    "inert species index {i} out of range for {} species",
                    self.n_species()
                )));
            }
        }
        Ok(())
    }
}

/// Errors surfaced by the tabulation cache.
#[derive(Error, Debug)]
pub enum IsatError {
    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A query vector does not match the configured composition size.
    #[error("composition has {got} entries, cache is sized for {expected}")]
    DimensionMismatch {
        /// Configured composition size.
        expected: usize,
        /// Size of the offending vector.
        got: usize,
    },

    /// A query vector contains NaN or infinite entries.
    #[error("non-finite entry in composition vector")]
    NonFiniteComposition,

    /// Leaf construction hit a numerical degeneracy (non-finite data,
    /// vanishing QR pivot, or an SVD that failed to converge). The
    /// caller falls back to the directly computed mapping.
    #[error("tabulation entry rejected: {0}")]
    DegenerateEntry(String),

    /// The chemistry solver failed; propagated unchanged.
    #[error("chemistry solver failed: {0}")]
    Chemistry(String),
}

/// Pack mass fractions, temperature, and pressure into a composition
/// vector φ in the layout the cache expects.
pub fn pack_phi(mass_fractions: &[f64], temperature: f64, pressure: f64) -> DVector<f64> {
    let mut phi = DVector::zeros(mass_fractions.len() + 2);
    for (i, &y) in mass_fractions.iter().enumerate() {
        phi[i] = y;
    }
    phi[mass_fractions.len()] = temperature;
    phi[mass_fractions.len() + 1] = pressure;
    phi
}
