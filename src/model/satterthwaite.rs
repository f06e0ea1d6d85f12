//! Satterthwaite denominator degrees of freedom for fixed-effect contrasts.
//!
//! For a single contrast `l`, `ν = 2 (l'Vl)² / (g' A g)` where `V` is the
//! fixed-effect covariance, `g_j = l' (∂V/∂φ_j) l` and `A` is the asymptotic
//! covariance of the variance parameters. Multi-df contrasts are split along
//! the eigenvectors of `L V L'` and the per-direction df are pooled.

use crate::model::lmm::LmmFit;
use nalgebra::{DMatrix, DVector};

/// Directions whose df differ by less than this are treated as equal.
const POOL_TOL: f64 = 1e-8;

/// Denominator df for the coefficients in `columns`, or `None` when the fit
/// carries no Satterthwaite terms or the approximation breaks down.
pub fn satterthwaite_df(fit: &LmmFit, columns: &[usize]) -> Option<f64> {
    let terms = fit.satterthwaite.as_ref()?;
    let q = columns.len();
    if q == 0 {
        return None;
    }

    let v_term = DMatrix::from_fn(q, q, |a, b| fit.vcov[(columns[a], columns[b])]);
    let eigen = v_term.symmetric_eigen();

    let mut nus = Vec::with_capacity(q);
    for m in 0..q {
        let d = eigen.eigenvalues[m];
        if !(d > 0.0) {
            return None;
        }
        let l = eigen.eigenvectors.column(m);

        let g = DVector::from_iterator(
            terms.vcov_jacobian.len(),
            terms.vcov_jacobian.iter().map(|jac| {
                let sub = DMatrix::from_fn(q, q, |a, b| jac[(columns[a], columns[b])]);
                l.dot(&(&sub * &l))
            }),
        );
        let denom = g.dot(&(&terms.varpar_cov * &g));
        if !(denom > 0.0) {
            return None;
        }

        let nu = 2.0 * d * d / denom;
        if !nu.is_finite() {
            return None;
        }
        nus.push(nu);
    }

    Some(pool_df(&nus))
}

/// Combine per-direction df into one F denominator df.
fn pool_df(nus: &[f64]) -> f64 {
    if nus.len() == 1 {
        return nus[0];
    }
    let mean = nus.iter().sum::<f64>() / nus.len() as f64;
    if nus.windows(2).all(|w| (w[1] - w[0]).abs() < POOL_TOL) {
        return mean;
    }
    if nus.iter().any(|&nu| nu <= 2.0) {
        return 2.0;
    }
    let e: f64 = nus.iter().map(|&nu| nu / (nu - 2.0)).sum();
    2.0 * e / (e - nus.len() as f64)
}
