//! Rank-one QR update used when an ellipsoid of accuracy grows.
//!
//! Growing replaces the ellipsoid factor Lᵀ with Lᵀ + u·vᵀ and then
//! restores near-triangularity with Givens rotations. Every rotation is
//! an orthogonal left-multiplication, so the quadratic form LᵀᵀLᵀ that
//! defines the ellipsoid is exactly the form of the perturbed factor;
//! triangularity is a storage convenience, not a correctness
//! requirement. The companion orthogonal factor Qᵀ receives the same
//! rotations so it stays paired with the updated triangle.

use nalgebra::{DMatrix, DVector};

/// Apply the rank-one update `r ← orth·(r + u·vᵀ)` where `orth` is the
/// product of Givens rotations that drives the result back towards
/// upper-triangular form. `qt` receives the identical rotation
/// sequence.
pub fn qr_update(r: &mut DMatrix<f64>, qt: &mut DMatrix<f64>, u: &DVector<f64>, v: &DVector<f64>) {
    let n = r.nrows();
    debug_assert_eq!(r.ncols(), n);
    debug_assert_eq!(u.len(), n);
    debug_assert_eq!(v.len(), n);

    let mut w = u.clone();

    // Index of the last nonzero entry of u.
    let mut k = n - 1;
    while k > 0 && w[k] == 0.0 {
        k -= 1;
    }

    // Fold u into a multiple of e₀ by rotating adjacent rows upward.
    for i in (0..k).rev() {
        rotate(r, qt, i, w[i], -w[i + 1]);
        w[i] = w[i].hypot(w[i + 1]);
    }

    // The whole perturbation now lives in row 0.
    for j in 0..n {
        r[(0, j)] += w[0] * v[j];
    }

    // Chase the introduced sub-diagonal entries back out.
    for i in 0..k {
        let a = r[(i, i)];
        let b = -r[(i + 1, i)];
        rotate(r, qt, i, a, b);
    }
}

/// Givens rotation of rows `i` and `i + 1` of `r` and `qt`, built from
/// the pair (a, b) with the overflow-safe construction.
fn rotate(r: &mut DMatrix<f64>, qt: &mut DMatrix<f64>, i: usize, a: f64, b: f64) {
    let (c, s) = if a == 0.0 {
        (0.0, if b >= 0.0 { 1.0 } else { -1.0 })
    } else if a.abs() > b.abs() {
        let f = b / a;
        let c = a.signum() / (1.0 + f * f).sqrt();
        (c, f * c)
    } else {
        let f = a / b;
        let s = b.signum() / (1.0 + f * f).sqrt();
        (f * s, s)
    };

    let n = r.ncols();
    for j in 0..n {
        let y = r[(i, j)];
        let w = r[(i + 1, j)];
        r[(i, j)] = c * y - s * w;
        r[(i + 1, j)] = s * y + c * w;
    }
    for j in 0..n {
        let y = qt[(i, j)];
        let w = qt[(i + 1, j)];
        qt[(i, j)] = c * y - s * w;
        qt[(i + 1, j)] = s * y + c * w;
    }
}
