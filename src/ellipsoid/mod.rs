//! Tabulated composition point with its ellipsoid of accuracy.
//!
//! A [`ChemPoint`] stores one sample of the mapping: the composition φ,
//! its image Rφ, the Jacobian A = ∂Rφ/∂φ, and an ellipsoid of accuracy
//!
//! ```text
//! E = { x : ‖Lᵀ·(x − φ)‖ ≤ 1 }
//! ```
//!
//! inside which linear interpolation from the stored data meets the
//! scaled tolerance ε.
//!
//! The factor Lᵀ starts as R from the QR decomposition of B·A/ε
//! (B = diag(1/scale)), i.e. the Cholesky factor of AᵀBᵀBA/ε². Since a
//! near-singular Jacobian direction would give the ellipsoid an
//! arbitrarily long semi-axis, the singular values of the factor are
//! floored at 1/2, bounding every semi-axis at 2 in scaled space.
//!
//! Growing covers a confirmed-accurate query point with the
//! minimum-volume ellipsoid containing the old ellipsoid and the point:
//! a rank-one modification of Lᵀ carried out with Givens rotations.
//!
//! References: S.B. Pope, "Computationally efficient implementation of
//! combustion chemistry using in situ adaptive tabulation", Combust.
//! Theory Modelling 1 (1997); L. Lu, S.B. Pope, "An improved algorithm
//! for in situ adaptive tabulation", JCP 228 (2009).

mod qr;

use nalgebra::{DMatrix, DVector};

use crate::reduction::ReducedState;
use crate::tree::NodeId;
use crate::IsatError;

/// Singular values of the EOA factor are floored at this value, capping
/// semi-axes at 2 in scaled space.
const MIN_SINGULAR_VALUE: f64 = 0.5;

/// Slack on the unit-ball membership test. A point absorbed by a grow
/// lands exactly on the boundary in exact arithmetic, so the comparison
/// must forgive the round-off of the rank-one update.
const EOA_SLACK: f64 = 1e-8;

/// Result of asking a leaf to cover a confirmed query point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowOutcome {
    /// The ellipsoid already contained the point; nothing changed.
    AlreadyCovered,
    /// The ellipsoid was inflated to reach the point.
    Grown,
}

/// One tabulation entry: a composition sample, its mapping, and the
/// ellipsoid of accuracy around it.
///
/// When a mechanism reduction was active at tabulation time, the
/// Jacobian and the ellipsoid factors live in the reduced subspace
/// (`n_active + 2` dimensions) while `phi` and `r_phi` keep the
/// complete-space layout; the leaf's own index maps translate between
/// the two.
#[derive(Debug, Clone)]
pub struct ChemPoint {
    /// Stored composition, complete space.
    phi: DVector<f64>,

    /// Mapping of the stored composition, complete space.
    r_phi: DVector<f64>,

    /// Jacobian of the mapping at `phi`, working-space dimensions.
    a: DMatrix<f64>,

    /// Ellipsoid factor Lᵀ, working-space dimensions.
    lt: DMatrix<f64>,

    /// Orthogonal companion Qᵀ from the QR of the scaled Jacobian,
    /// rotated alongside `lt` on every grow.
    qt: DMatrix<f64>,

    /// Per-component scale factors, complete space.
    scale_factor: DVector<f64>,

    /// Tolerance the ellipsoid was built for.
    eps_tol: f64,

    /// Complete-space index of each working-space dimension.
    active_index: Vec<usize>,

    /// Reduction the leaf was tabulated under, if any.
    reduction: Option<ReducedState>,

    /// Inert species excluded from EOA distance tests.
    inert_index: Option<usize>,

    /// Tree node whose slot holds this leaf.
    node: Option<NodeId>,

    n_used: u64,
    n_grown: u64,
    time_tag: f64,
    last_time_used: f64,
    last_error: f64,
    to_remove: bool,
}

impl ChemPoint {
    /// Tabulate a new point.
    ///
    /// `jacobian` is given in the complete space; when `reduction` is
    /// present only the active rows and columns (plus temperature and
    /// pressure) enter the ellipsoid algebra.
    ///
    /// Fails with [`IsatError::DegenerateEntry`] on non-finite inputs,
    /// a vanishing QR pivot, or an SVD that does not converge. A failed
    /// construction leaves nothing to clean up.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        phi: DVector<f64>,
        r_phi: DVector<f64>,
        jacobian: &DMatrix<f64>,
        scale_factor: DVector<f64>,
        eps_tol: f64,
        time: f64,
        reduction: Option<ReducedState>,
        inert_index: Option<usize>,
    ) -> Result<Self, IsatError> {
        let n_eq = phi.len();
        assert_eq!(r_phi.len(), n_eq, "mapping length mismatch");
        assert_eq!(jacobian.nrows(), n_eq, "jacobian row count mismatch");
        assert_eq!(jacobian.ncols(), n_eq, "jacobian column count mismatch");
        assert_eq!(scale_factor.len(), n_eq, "scale factor length mismatch");

        if !vec_finite(&phi) || !vec_finite(&r_phi) {
            return Err(IsatError::DegenerateEntry(
                "non-finite composition or mapping".to_string(),
            ));
        }
        if !jacobian.iter().all(|x| x.is_finite()) {
            return Err(IsatError::DegenerateEntry(
                "non-finite Jacobian entry".to_string(),
            ));
        }

        let active_index = match &reduction {
            Some(red) => {
                assert_eq!(red.n_species() + 2, n_eq, "reduction mask length mismatch");
                let mut idx: Vec<usize> = red.simplified_to_complete.clone();
                idx.push(n_eq - 2);
                idx.push(n_eq - 1);
                idx
            }
            None => (0..n_eq).collect(),
        };
        let dim = active_index.len();

        // Working-space Jacobian, then B·A/ε.
        let a = DMatrix::from_fn(dim, dim, |i, j| {
            jacobian[(active_index[i], active_index[j])]
        });
        let ba = DMatrix::from_fn(dim, dim, |i, j| {
            a[(i, j)] / (scale_factor[active_index[i]] * eps_tol)
        });

        let (q, r) = ba.qr().unpack();
        for i in 0..dim {
            let pivot = r[(i, i)];
            if !pivot.is_finite() || pivot.abs() < f64::MIN_POSITIVE {
                return Err(IsatError::DegenerateEntry(format!(
                    "vanishing QR pivot in dimension {i}"
                )));
            }
        }

        // Floor the singular values so no semi-axis exceeds 2.
        let mut svd = r
            .try_svd(true, true, f64::EPSILON, 0)
            .ok_or_else(|| IsatError::DegenerateEntry("SVD did not converge".to_string()))?;
        for value in svd.singular_values.iter_mut() {
            if *value < MIN_SINGULAR_VALUE {
                *value = MIN_SINGULAR_VALUE;
            }
        }
        let lt = svd
            .recompose()
            .map_err(|e| IsatError::DegenerateEntry(e.to_string()))?;
        if !lt.iter().all(|x| x.is_finite()) {
            return Err(IsatError::DegenerateEntry(
                "non-finite ellipsoid factor".to_string(),
            ));
        }

        Ok(Self {
            phi,
            r_phi,
            a,
            lt,
            qt: q.transpose(),
            scale_factor,
            eps_tol,
            active_index,
            reduction,
            inert_index,
            node: None,
            n_used: 0,
            n_grown: 0,
            time_tag: time,
            last_time_used: time,
            last_error: 0.0,
            to_remove: false,
        })
    }

    /// Working-space difference φ_q − φ for the ellipsoid tests, with
    /// the inert coordinate zeroed.
    fn eoa_diff(&self, phi_q: &DVector<f64>) -> DVector<f64> {
        let mut d = self.model_diff(phi_q);
        if let Some(inert) = self.inert_index {
            if let Some(row) = self.working_row(inert) {
                d[row] = 0.0;
            }
        }
        d
    }

    /// Working-space difference φ_q − φ for the linear model.
    pub(crate) fn model_diff(&self, phi_q: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(self.active_index.len(), |i, _| {
            let ci = self.active_index[i];
            phi_q[ci] - self.phi[ci]
        })
    }

    /// Working-space row of a complete-space index, if it is tabulated.
    fn working_row(&self, ci: usize) -> Option<usize> {
        match &self.reduction {
            None => Some(ci),
            Some(red) => {
                let n_species = red.n_species();
                if ci >= n_species {
                    Some(red.n_active() + (ci - n_species))
                } else {
                    red.complete_to_simplified[ci]
                }
            }
        }
    }

    /// Is the query inside the ellipsoid of accuracy?
    ///
    /// Computes ‖Lᵀ·(φ_q − φ)‖² row by row, bailing out as soon as the
    /// running sum passes 1. No state is touched; usage accounting is
    /// the controller's job.
    pub fn in_eoa(&self, phi_q: &DVector<f64>) -> bool {
        let d = self.eoa_diff(phi_q);
        let dim = d.len();
        let mut sum = 0.0;
        for i in 0..dim {
            let mut yi = 0.0;
            for j in 0..dim {
                yi += self.lt[(i, j)] * d[j];
            }
            sum += yi * yi;
            if sum > 1.0 + EOA_SLACK {
                return false;
            }
        }
        true
    }

    /// Does the freshly computed mapping confirm the linear model at
    /// the query point?
    ///
    /// Evaluates the scaled error ε_g = ‖B·(ΔR − A·Δφ)‖ and records it
    /// as the leaf's last error. A passing check licenses a grow in
    /// place of a new tabulation.
    pub fn check_solution(&mut self, phi_q: &DVector<f64>, r_phi_q: &DVector<f64>) -> bool {
        let d = self.model_diff(phi_q);
        let dr_lin = &self.a * &d;
        let mut err2 = 0.0;
        for (row, &ci) in self.active_index.iter().enumerate() {
            let dr = r_phi_q[ci] - self.r_phi[ci];
            let e = (dr - dr_lin[row]) / self.scale_factor[ci];
            err2 += e * e;
        }
        let eps_g = err2.sqrt();
        self.last_error = eps_g;
        eps_g <= self.eps_tol
    }

    /// Inflate the ellipsoid to the minimum-volume one covering both
    /// the current ellipsoid and φ_q.
    ///
    /// The caller must have confirmed the linear model at φ_q with
    /// [`ChemPoint::check_solution`]. In the transformed frame
    /// p′ = Lᵀ·(φ_q − φ), the update is Lᵀ ← (I + γ·p′p′ᵀ)·Lᵀ with
    /// γ = (1/‖p′‖ − 1)/‖p′‖², applied as a rank-one QR update.
    pub fn grow(&mut self, phi_q: &DVector<f64>) -> GrowOutcome {
        let d = self.eoa_diff(phi_q);
        let p = &self.lt * &d;
        let s2 = p.norm_squared();
        if s2 <= 1.0 + EOA_SLACK {
            return GrowOutcome::AlreadyCovered;
        }
        let s = s2.sqrt();
        let gamma = (1.0 / s - 1.0) / s2;

        let u = &p * gamma;
        let v = self.lt.transpose() * &p;
        qr::qr_update(&mut self.lt, &mut self.qt, &u, &v);

        self.n_grown += 1;
        GrowOutcome::Grown
    }

    /// Linear interpolation of the mapping at the query point:
    /// Rφ_q = Rφ + A·(φ_q − φ).
    ///
    /// Under a reduction only active components enter the product;
    /// species outside the tabulated subspace pass through unreacted.
    pub fn interpolate(&self, phi_q: &DVector<f64>) -> DVector<f64> {
        let d = self.model_diff(phi_q);
        let dr = &self.a * &d;
        let mut out = self.r_phi.clone();
        for (row, &ci) in self.active_index.iter().enumerate() {
            out[ci] += dr[row];
        }
        if let Some(red) = &self.reduction {
            for (ci, &flag) in red.active.iter().enumerate() {
                if !flag {
                    out[ci] += phi_q[ci] - self.phi[ci];
                }
            }
        }
        out
    }

    /// Record a successful retrieve at the given simulation time.
    pub fn record_use(&mut self, time: f64) {
        self.n_used += 1;
        self.last_time_used = time;
    }

    /// Refresh the idle clock without counting a retrieve.
    pub fn touch(&mut self, time: f64) {
        self.last_time_used = time;
    }

    // Access

    /// Stored composition φ.
    pub fn phi(&self) -> &DVector<f64> {
        &self.phi
    }

    /// Stored mapping Rφ.
    pub fn r_phi(&self) -> &DVector<f64> {
        &self.r_phi
    }

    /// Jacobian in working-space dimensions.
    pub fn jacobian(&self) -> &DMatrix<f64> {
        &self.a
    }

    /// Ellipsoid factor Lᵀ in working-space dimensions.
    pub fn lt(&self) -> &DMatrix<f64> {
        &self.lt
    }

    /// Size of the working space the ellipsoid lives in.
    pub fn dim(&self) -> usize {
        self.active_index.len()
    }

    /// Size of the complete composition space.
    pub fn n_eq(&self) -> usize {
        self.phi.len()
    }

    /// Reduction the leaf was tabulated under, if any.
    pub fn reduction(&self) -> Option<&ReducedState> {
        self.reduction.as_ref()
    }

    /// Complete-space index of each working-space dimension.
    pub(crate) fn active_index(&self) -> &[usize] {
        &self.active_index
    }

    /// Number of retrieves served by this leaf.
    pub fn n_used(&self) -> u64 {
        self.n_used
    }

    /// Number of times the ellipsoid was grown.
    pub fn n_grown(&self) -> u64 {
        self.n_grown
    }

    /// Simulation time at tabulation.
    pub fn time_tag(&self) -> f64 {
        self.time_tag
    }

    /// Simulation time of the most recent retrieve.
    pub fn last_time_used(&self) -> f64 {
        self.last_time_used
    }

    /// Scaled model error measured by the most recent solution check.
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Pending-deletion mark used by the cleaning sweep.
    pub fn to_remove(&self) -> bool {
        self.to_remove
    }

    /// Set or clear the pending-deletion mark.
    pub fn set_to_remove(&mut self, flag: bool) {
        self.to_remove = flag;
    }

    /// Tree node whose slot holds this leaf.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub(crate) fn set_node(&mut self, node: Option<NodeId>) {
        self.node = node;
    }
}

fn vec_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_scale(n: usize) -> DVector<f64> {
        DVector::from_element(n, 1.0)
    }

    fn diagonal_leaf(diag: &[f64], eps: f64) -> ChemPoint {
        let n = diag.len();
        let phi = DVector::zeros(n);
        let r_phi = DVector::zeros(n);
        let jac = DMatrix::from_fn(n, n, |i, j| if i == j { diag[i] } else { 0.0 });
        ChemPoint::new(phi, r_phi, &jac, unit_scale(n), eps, 0.0, None, None)
            .expect("leaf construction")
    }

    #[test]
    fn test_singular_values_are_floored() {
        // Jacobian entry 1e-9 would give a semi-axis of 1e6 in scaled
        // space; the floor caps it at 2.
        let leaf = diagonal_leaf(&[1.0, 1e-9, 1.0], 1e-3);
        let svd = leaf
            .lt()
            .clone()
            .try_svd(false, false, f64::EPSILON, 0)
            .unwrap();
        for value in svd.singular_values.iter() {
            assert!(*value >= MIN_SINGULAR_VALUE - 1e-12, "value {value} below floor");
        }
    }

    #[test]
    fn test_in_eoa_matches_semi_axes() {
        // diag(0.1) jacobian at ε = 1e-3 gives spherical semi-axes of
        // 1e-2.
        let leaf = diagonal_leaf(&[0.1, 0.1, 0.1], 1e-3);
        let inside = DVector::from_vec(vec![0.005, 0.0, 0.0]);
        let outside = DVector::from_vec(vec![0.02, 0.0, 0.0]);
        assert!(leaf.in_eoa(&inside));
        assert!(!leaf.in_eoa(&outside));
    }

    #[test]
    fn test_grow_reaches_query_and_keeps_interior() {
        let mut leaf = diagonal_leaf(&[0.1, 0.1, 0.1], 1e-3);
        let interior = DVector::from_vec(vec![0.004, 0.003, 0.0]);
        let target = DVector::from_vec(vec![0.05, 0.0, 0.0]);
        assert!(leaf.in_eoa(&interior));
        assert!(!leaf.in_eoa(&target));

        assert_eq!(leaf.grow(&target), GrowOutcome::Grown);
        assert_eq!(leaf.n_grown(), 1);
        assert!(leaf.in_eoa(&target), "grown ellipsoid must reach the query");
        assert!(leaf.in_eoa(&interior), "grow must not lose covered points");
    }

    #[test]
    fn test_grow_inside_is_a_no_op() {
        let mut leaf = diagonal_leaf(&[0.1, 0.1, 0.1], 1e-3);
        let inside = DVector::from_vec(vec![0.001, 0.001, 0.0]);
        assert_eq!(leaf.grow(&inside), GrowOutcome::AlreadyCovered);
        assert_eq!(leaf.n_grown(), 0);
    }

    #[test]
    fn test_check_solution_records_error() {
        let mut leaf = diagonal_leaf(&[0.1, 0.1, 0.1], 1e-3);
        let phi_q = DVector::from_vec(vec![0.01, 0.0, 0.0]);
        // Exact linear mapping: R = diag(0.1)·φ.
        let exact = DVector::from_vec(vec![0.001, 0.0, 0.0]);
        assert!(leaf.check_solution(&phi_q, &exact));
        assert!(leaf.last_error() < 1e-14);

        // A mapping off by 1e-2 in one component fails at ε = 1e-3.
        let wrong = DVector::from_vec(vec![0.011, 0.0, 0.0]);
        assert!(!leaf.check_solution(&phi_q, &wrong));
        assert!((leaf.last_error() - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn test_interpolate_is_exact_for_linear_mapping() {
        let n = 3;
        let jac = DMatrix::from_row_slice(
            n,
            n,
            &[0.2, 0.05, 0.0, 0.01, 0.3, 0.02, 0.0, 0.1, 0.25],
        );
        let phi = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let r_phi = &jac * &phi;
        let leaf = ChemPoint::new(
            phi.clone(),
            r_phi,
            &jac,
            unit_scale(n),
            1e-3,
            0.0,
            None,
            None,
        )
        .unwrap();

        let phi_q = DVector::from_vec(vec![0.11, 0.19, 0.31]);
        let interp = leaf.interpolate(&phi_q);
        let exact = &jac * &phi_q;
        assert!((interp - exact).norm() < 1e-12);
    }

    #[test]
    fn test_reduced_leaf_ignores_inactive_coordinate() {
        // 3 species, third inactive: working space is 2 + T + p.
        let n = 5;
        let red = ReducedState::from_mask(&[true, true, false]);
        let phi = DVector::zeros(n);
        let r_phi = DVector::zeros(n);
        let jac = DMatrix::from_diagonal(&DVector::from_vec(vec![0.1, 0.1, 0.1, 0.1, 0.1]));
        let leaf = ChemPoint::new(
            phi,
            r_phi,
            &jac,
            unit_scale(n),
            1e-3,
            0.0,
            Some(red),
            None,
        )
        .unwrap();
        assert_eq!(leaf.dim(), 4);

        // Huge excursion in the inactive species stays inside.
        let mut phi_q = DVector::zeros(n);
        phi_q[2] = 1000.0;
        assert!(leaf.in_eoa(&phi_q));

        // The same excursion in an active species does not.
        let mut phi_q = DVector::zeros(n);
        phi_q[0] = 1000.0;
        assert!(!leaf.in_eoa(&phi_q));
    }

    #[test]
    fn test_inert_species_is_skipped() {
        let leaf = {
            let n = 3;
            let phi = DVector::zeros(n);
            let r_phi = DVector::zeros(n);
            let jac = DMatrix::from_diagonal(&DVector::from_vec(vec![0.1, 0.1, 0.1]));
            ChemPoint::new(phi, r_phi, &jac, unit_scale(n), 1e-3, 0.0, None, Some(0)).unwrap()
        };
        let mut phi_q = DVector::zeros(3);
        phi_q[0] = 5.0;
        assert!(leaf.in_eoa(&phi_q), "inert coordinate must not count");
    }

    #[test]
    fn test_non_finite_inputs_are_rejected() {
        let n = 3;
        let mut phi = DVector::zeros(n);
        phi[1] = f64::NAN;
        let jac = DMatrix::identity(n, n);
        let result = ChemPoint::new(
            phi,
            DVector::zeros(n),
            &jac,
            unit_scale(n),
            1e-3,
            0.0,
            None,
            None,
        );
        assert!(matches!(result, Err(IsatError::DegenerateEntry(_))));
    }

    #[test]
    fn test_zero_jacobian_is_rejected() {
        let n = 3;
        let jac = DMatrix::zeros(n, n);
        let result = ChemPoint::new(
            DVector::zeros(n),
            DVector::zeros(n),
            &jac,
            unit_scale(n),
            1e-3,
            0.0,
            None,
            None,
        );
        assert!(matches!(result, Err(IsatError::DegenerateEntry(_))));
    }
}
