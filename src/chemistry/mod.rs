//! Chemistry solver interface.
//!
//! The cache never integrates anything itself: on a miss it asks a
//! [`ChemistrySolver`] for the mapped composition and the mapping
//! gradient, then decides whether the result grows an existing
//! ellipsoid or seeds a new tabulation entry.
//!
//! Two synthetic solvers ship with the crate. [`LinearChemistry`] is
//! exactly its own tangent model, so every solution check passes and a
//! cache driven by it answers every repeat query by retrieval; it is
//! the reference model for exactness properties. [`QuadraticChemistry`]
//! adds curvature, which makes solution checks fail away from the
//! stored point and exercises the full retrieve/grow/add decision
//! space.

use nalgebra::{DMatrix, DVector};

use crate::IsatError;

/// Mapped composition and its gradient, as returned by one solver
/// call.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Image Rφ of the queried composition.
    pub r_phi: DVector<f64>,
    /// Jacobian A = ∂Rφ/∂φ at the queried composition.
    pub jacobian: DMatrix<f64>,
}

/// Source of the expensive mapping R.
///
/// From the cache's point of view `compute` is a pure function of φ:
/// it must not observe or mutate cache state, and identical inputs are
/// expected to produce identical outputs. Failures propagate out of the
/// cache unchanged, with no tabulation side effects.
pub trait ChemistrySolver {
    /// Number of species in the mechanism; the composition space has
    /// two more dimensions (temperature and pressure).
    fn n_species(&self) -> usize;

    /// Integrate the mapping at φ and return Rφ with its Jacobian.
    fn compute(&mut self, phi: &DVector<f64>) -> Result<Mapping, IsatError>;
}

/// Affine mapping R(φ) = M·φ + b.
#[derive(Debug, Clone)]
pub struct LinearChemistry {
    m: DMatrix<f64>,
    b: DVector<f64>,
}

impl LinearChemistry {
    /// Build from the matrix and offset. `m` must be square and sized
    /// to the full composition space.
    pub fn new(m: DMatrix<f64>, b: DVector<f64>) -> Self {
        assert_eq!(m.nrows(), m.ncols(), "mapping matrix must be square");
        assert_eq!(m.nrows(), b.len(), "offset length must match the matrix");
        Self { m, b }
    }

    /// The mapping matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.m
    }
}

impl ChemistrySolver for LinearChemistry {
    fn n_species(&self) -> usize {
        self.m.nrows() - 2
    }

    fn compute(&mut self, phi: &DVector<f64>) -> Result<Mapping, IsatError> {
        Ok(Mapping {
            r_phi: &self.m * phi + &self.b,
            jacobian: self.m.clone(),
        })
    }
}

/// Mapping with componentwise curvature:
/// R(φ)ᵢ = (M·φ + b)ᵢ + cᵢ·φᵢ².
///
/// The Jacobian picks up the state-dependent diagonal 2·cᵢ·φᵢ, so the
/// tangent model degrades with distance at a controllable rate.
#[derive(Debug, Clone)]
pub struct QuadraticChemistry {
    m: DMatrix<f64>,
    b: DVector<f64>,
    c: DVector<f64>,
}

impl QuadraticChemistry {
    /// Build from the linear part and the per-component curvature.
    pub fn new(m: DMatrix<f64>, b: DVector<f64>, c: DVector<f64>) -> Self {
        assert_eq!(m.nrows(), m.ncols(), "mapping matrix must be square");
        assert_eq!(m.nrows(), b.len(), "offset length must match the matrix");
        assert_eq!(m.nrows(), c.len(), "curvature length must match the matrix");
        Self { m, b, c }
    }
}

impl ChemistrySolver for QuadraticChemistry {
    fn n_species(&self) -> usize {
        self.m.nrows() - 2
    }

    fn compute(&mut self, phi: &DVector<f64>) -> Result<Mapping, IsatError> {
        let mut r_phi = &self.m * phi + &self.b;
        for i in 0..phi.len() {
            r_phi[i] += self.c[i] * phi[i] * phi[i];
        }
        let mut jacobian = self.m.clone();
        for i in 0..phi.len() {
            jacobian[(i, i)] += 2.0 * self.c[i] * phi[i];
        }
        Ok(Mapping { r_phi, jacobian })
    }
}
