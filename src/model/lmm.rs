//! Linear Mixed Models (LMM) with crossed random intercepts.
//!
//! Fits `y = Xβ + Σ_k Z_k u_k + ε` where `u_k ~ N(0, σ_k² I)` and `ε ~ N(0, σ² I)`
//! by REML. Each grouping factor contributes one block of random intercepts, so
//! `(1 | participant) + (1 | item)` gives two crossed variance components.
//!
//! Estimation runs EM-REML on the mixed-model equations written in the relative
//! covariance parametrisation `θ_k = σ_k / σ`:
//!
//! ```text
//! | Λ'Z'ZΛ + I   Λ'Z'X | | v |   | Λ'Z'y |
//! | X'ZΛ         X'X   | | β | = | X'y   |
//! ```
//!
//! which stays well conditioned as a variance component approaches zero. All
//! cross-products are computed once, so each iteration only touches a
//! `(q + p) × (q + p)` system.
//!
//! # Example
//! ```ignore
//! use composable_power::model::lmm::{fit_lmm_from_formula, LmmConfig};
//!
//! let fit = fit_lmm_from_formula(
//!     &dataset,
//!     "RT ~ type + (1 | participant) + (1 | item)",
//!     None,
//! ).unwrap();
//! ```

use crate::data::{
    DesignMatrix, MixedFormula, RandomDesignMatrix, SimulatedDataset, TermColumns,
    RESPONSE_COLUMN,
};
use crate::error::{PowerError, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::ops::Range;

/// Method for the denominator degrees of freedom of fixed-effect tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DfMethod {
    /// Satterthwaite approximation from the REML deviance curvature.
    #[default]
    Satterthwaite,
    /// Residual degrees of freedom (n - p).
    Residual,
}

/// Configuration for LMM fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmmConfig {
    /// Maximum EM iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the REML deviance.
    pub tol: f64,
    /// A component with `σ_k / σ` below this is a singular (boundary) fit.
    pub singular_tol: f64,
    /// Denominator df method for fixed-effect tests.
    pub df_method: DfMethod,
    /// Relative step for numerical derivatives of the deviance.
    pub derivative_step: f64,
}

impl Default for LmmConfig {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-6,
            singular_tol: 1e-4,
            df_method: DfMethod::Satterthwaite,
            derivative_step: 1e-3,
        }
    }
}

impl LmmConfig {
    /// Set the iteration ceiling.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set the deviance tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Set the df method.
    pub fn with_df_method(mut self, df_method: DfMethod) -> Self {
        self.df_method = df_method;
        self
    }
}

/// Estimated variance of one random-intercept grouping factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponent {
    /// Grouping variable.
    pub grouping: String,
    /// Number of groups.
    pub n_groups: usize,
    /// Estimated variance σ_k².
    pub variance: f64,
}

impl VarianceComponent {
    /// Estimated standard deviation.
    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }
}

/// Derivatives needed for Satterthwaite degrees of freedom.
#[derive(Debug, Clone)]
pub struct SatterthwaiteTerms {
    /// d Var(β̂) / d φ_j for each free variance parameter.
    pub vcov_jacobian: Vec<DMatrix<f64>>,
    /// Asymptotic covariance of the free variance parameters (2 H⁻¹).
    pub varpar_cov: DMatrix<f64>,
}

/// Results from fitting an LMM.
#[derive(Debug, Clone)]
pub struct LmmFit {
    /// Fixed effect coefficient names.
    pub coefficient_names: Vec<String>,
    /// Estimated fixed effects.
    pub coefficients: Vec<f64>,
    /// Standard errors of fixed effects.
    pub std_errors: Vec<f64>,
    /// Covariance matrix of the fixed effects.
    pub vcov: DMatrix<f64>,
    /// Design columns belonging to each fixed term.
    pub term_columns: Vec<TermColumns>,
    /// Random-intercept variance components, one per grouping factor.
    pub random_effects: Vec<VarianceComponent>,
    /// Residual variance σ².
    pub sigma2: f64,
    /// REML log-likelihood at the estimates.
    pub log_reml: f64,
    /// Residual degrees of freedom (n - p).
    pub df_residual: f64,
    /// Number of observations.
    pub n_obs: usize,
    /// Number of EM iterations.
    pub iterations: usize,
    /// Whether the deviance converged before the iteration ceiling.
    pub converged: bool,
    /// Whether any variance component sits on the boundary.
    pub singular: bool,
    /// Denominator df method requested for tests.
    pub df_method: DfMethod,
    /// Satterthwaite derivatives; `None` when unavailable or not requested.
    pub satterthwaite: Option<SatterthwaiteTerms>,
}

impl LmmFit {
    /// Get coefficient index by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Get coefficient by name.
    pub fn get_coefficient(&self, name: &str) -> Option<f64> {
        self.coefficient_index(name)
            .and_then(|i| self.coefficients.get(i).copied())
    }

    /// Design columns of a fixed term.
    pub fn term(&self, term: &str) -> Option<&TermColumns> {
        self.term_columns.iter().find(|t| t.term == term)
    }

    /// Whether the fit has at least one random effect.
    pub fn is_mixed(&self) -> bool {
        !self.random_effects.is_empty()
    }

    /// Relative standard deviations `σ_k / σ`.
    pub fn theta(&self) -> Vec<f64> {
        self.random_effects
            .iter()
            .map(|c| (c.variance.max(0.0) / self.sigma2).sqrt())
            .collect()
    }

    /// Variance component by grouping variable.
    pub fn variance_component(&self, grouping: &str) -> Option<&VarianceComponent> {
        self.random_effects.iter().find(|c| c.grouping == grouping)
    }

    /// Number of fixed effect coefficients.
    pub fn n_coefficients(&self) -> usize {
        self.coefficient_names.len()
    }
}

/// Penalised least-squares solution for one value of the variance parameters.
struct PlsSolution {
    beta: DVector<f64>,
    v: DVector<f64>,
    /// Penalised residual sum of squares `‖y - Xβ - ZΛv‖² + ‖v‖²`.
    r2: f64,
    /// `log |C_θ|`.
    log_det: f64,
    chol: Cholesky<f64, Dyn>,
}

/// Cross-products of the mixed model, computed once per dataset.
struct MixedModelEquations {
    xtx: DMatrix<f64>,
    xtz: DMatrix<f64>,
    ztz: DMatrix<f64>,
    xty: DVector<f64>,
    zty: DVector<f64>,
    yty: f64,
    n: usize,
    p: usize,
    q: usize,
    blocks: Vec<Range<usize>>,
}

impl MixedModelEquations {
    fn new(y: &DVector<f64>, x: &DMatrix<f64>, z: &DMatrix<f64>, blocks: Vec<Range<usize>>) -> Self {
        let xt = x.transpose();
        let zt = z.transpose();
        Self {
            xtx: &xt * x,
            xtz: &xt * z,
            ztz: &zt * z,
            xty: &xt * y,
            zty: &zt * y,
            yty: y.dot(y),
            n: x.nrows(),
            p: x.ncols(),
            q: z.ncols(),
            blocks,
        }
    }

    /// Split `φ = (σ_1², ..., σ_K², σ²)` into the expanded diagonal of Λ and σ².
    fn relative_factors(&self, phi: &[f64]) -> Result<(DVector<f64>, f64)> {
        let k = self.blocks.len();
        let sigma2 = phi[k];
        if !(sigma2 > 0.0) || !sigma2.is_finite() {
            return Err(PowerError::FitFailure(format!(
                "Residual variance must be positive, got {}",
                sigma2
            )));
        }
        let mut lam = DVector::zeros(self.q);
        for (block, range) in self.blocks.iter().enumerate() {
            let theta = (phi[block].max(0.0) / sigma2).sqrt();
            for i in range.clone() {
                lam[i] = theta;
            }
        }
        Ok((lam, sigma2))
    }

    /// Solve the penalised least-squares system for a given Λ.
    fn solve(&self, lam: &DVector<f64>) -> Result<PlsSolution> {
        let (p, q) = (self.p, self.q);
        let dim = p + q;

        let mut c = DMatrix::zeros(dim, dim);
        for i in 0..q {
            for j in 0..q {
                c[(i, j)] = lam[i] * self.ztz[(i, j)] * lam[j];
            }
            c[(i, i)] += 1.0;
            for j in 0..p {
                let value = lam[i] * self.xtz[(j, i)];
                c[(i, q + j)] = value;
                c[(q + j, i)] = value;
            }
        }
        for i in 0..p {
            for j in 0..p {
                c[(q + i, q + j)] = self.xtx[(i, j)];
            }
        }

        let mut rhs = DVector::zeros(dim);
        for i in 0..q {
            rhs[i] = lam[i] * self.zty[i];
        }
        for j in 0..p {
            rhs[q + j] = self.xty[j];
        }

        let chol = c.cholesky().ok_or_else(|| {
            PowerError::FitFailure(
                "Mixed model equations are not positive definite (rank-deficient fixed effects?)"
                    .to_string(),
            )
        })?;

        let solution = chol.solve(&rhs);
        let v = solution.rows(0, q).into_owned();
        let beta = solution.rows(q, p).into_owned();

        let mut r2 = self.yty - beta.dot(&self.xty);
        for i in 0..q {
            r2 -= v[i] * lam[i] * self.zty[i];
        }

        let log_det = 2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();

        Ok(PlsSolution {
            beta,
            v,
            r2,
            log_det,
            chol,
        })
    }

    /// REML deviance `-2 ℓ_R(φ)`.
    fn deviance(&self, phi: &[f64]) -> Result<f64> {
        let (lam, sigma2) = self.relative_factors(phi)?;
        let sol = self.solve(&lam)?;
        Ok(self.deviance_from(&sol, sigma2))
    }

    fn deviance_from(&self, sol: &PlsSolution, sigma2: f64) -> f64 {
        let df = (self.n - self.p) as f64;
        df * (2.0 * PI * sigma2).ln() + sol.log_det + sol.r2 / sigma2
    }

    /// Fixed-effect covariance `σ² [C_θ⁻¹]_ββ`.
    fn vcov(&self, phi: &[f64]) -> Result<DMatrix<f64>> {
        let (lam, sigma2) = self.relative_factors(phi)?;
        let sol = self.solve(&lam)?;
        Ok(self.vcov_from(&sol, sigma2))
    }

    fn vcov_from(&self, sol: &PlsSolution, sigma2: f64) -> DMatrix<f64> {
        let inverse = sol.chol.inverse();
        inverse.view((self.q, self.q), (self.p, self.p)).into_owned() * sigma2
    }

    /// One EM-REML update of `φ`.
    fn em_step(&self, phi: &[f64], lam: &DVector<f64>, sol: &PlsSolution) -> Vec<f64> {
        let k = self.blocks.len();
        let sigma2 = phi[k];
        let inverse = sol.chol.inverse();

        let mut next = Vec::with_capacity(k + 1);
        for range in &self.blocks {
            let theta2 = lam[range.start].powi(2);
            let ss: f64 = range.clone().map(|i| sol.v[i].powi(2)).sum();
            let trace: f64 = range.clone().map(|i| inverse[(i, i)]).sum();
            next.push(theta2 * (ss + sigma2 * trace) / range.len() as f64);
        }
        next.push(sol.r2 / (self.n - self.p) as f64);
        next
    }

    /// Numerical Hessian of the deviance and Jacobian of Var(β̂) over the free parameters.
    fn satterthwaite_terms(
        &self,
        phi: &[f64],
        free: &[usize],
        step: f64,
    ) -> Result<SatterthwaiteTerms> {
        let m = free.len();
        let h: Vec<f64> = free.iter().map(|&j| step * phi[j]).collect();
        let shifted = |shifts: &[(usize, f64)]| -> Result<f64> {
            let mut point = phi.to_vec();
            for &(a, delta) in shifts {
                point[free[a]] += delta;
            }
            self.deviance(&point)
        };

        let f0 = self.deviance(phi)?;
        let mut hessian = DMatrix::zeros(m, m);
        for a in 0..m {
            let plus = shifted(&[(a, h[a])])?;
            let minus = shifted(&[(a, -h[a])])?;
            hessian[(a, a)] = (plus - 2.0 * f0 + minus) / (h[a] * h[a]);
            for b in 0..a {
                let pp = shifted(&[(a, h[a]), (b, h[b])])?;
                let pm = shifted(&[(a, h[a]), (b, -h[b])])?;
                let mp = shifted(&[(a, -h[a]), (b, h[b])])?;
                let mm = shifted(&[(a, -h[a]), (b, -h[b])])?;
                let value = (pp - pm - mp + mm) / (4.0 * h[a] * h[b]);
                hessian[(a, b)] = value;
                hessian[(b, a)] = value;
            }
        }

        let hessian_chol = hessian.cholesky().ok_or_else(|| {
            PowerError::Numerical("REML deviance Hessian is not positive definite".to_string())
        })?;
        let varpar_cov = hessian_chol.inverse() * 2.0;

        let mut vcov_jacobian = Vec::with_capacity(m);
        for (a, &j) in free.iter().enumerate() {
            let mut up = phi.to_vec();
            let mut down = phi.to_vec();
            up[j] += h[a];
            down[j] -= h[a];
            let derivative = (self.vcov(&up)? - self.vcov(&down)?) / (2.0 * h[a]);
            vcov_jacobian.push(derivative);
        }

        Ok(SatterthwaiteTerms {
            vcov_jacobian,
            varpar_cov,
        })
    }
}

/// Balanced-ANOVA moment estimates used as EM starting values.
///
/// Components with a non-positive moment estimate start (and stay) at zero.
fn initial_estimates(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    random: &[RandomDesignMatrix],
) -> Result<Vec<f64>> {
    let n = y.len();
    let p = x.ncols();

    let xtx = x.transpose() * x;
    let xtx_chol = xtx.cholesky().ok_or_else(|| {
        PowerError::FitFailure("Fixed-effects design is rank deficient".to_string())
    })?;
    let beta_ols = xtx_chol.solve(&(x.transpose() * y));
    let residuals = y - x * beta_ols;

    let mut within = residuals.clone();
    let mut between = Vec::with_capacity(random.len());
    let mut absorbed = 0usize;

    for block in random {
        let mut sums = vec![0.0; block.n_groups];
        for (i, &g) in block.group_indices.iter().enumerate() {
            sums[g] += residuals[i];
        }
        let counts = block.observations_per_group();
        let means: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .map(|(s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
            .collect();

        let var_means = if block.n_groups > 1 {
            let grand = means.iter().sum::<f64>() / block.n_groups as f64;
            means.iter().map(|m| (m - grand).powi(2)).sum::<f64>() / (block.n_groups - 1) as f64
        } else {
            0.0
        };
        let mean_count = n as f64 / block.n_groups as f64;
        between.push((var_means, mean_count));

        for (i, &g) in block.group_indices.iter().enumerate() {
            within[i] -= means[g];
        }
        absorbed += block.n_groups.saturating_sub(1);
    }

    let (ss, df) = if n > p + absorbed {
        (within.norm_squared(), (n - p - absorbed) as f64)
    } else {
        (residuals.norm_squared(), (n - p) as f64)
    };
    let sigma2 = ss / df;

    let scale = y.norm_squared() / n as f64;
    if !(sigma2 > f64::EPSILON * scale.max(1.0) * 16.0) {
        return Err(PowerError::FitFailure(
            "Residual variance is zero; the response is fitted exactly".to_string(),
        ));
    }

    let mut phi: Vec<f64> = between
        .into_iter()
        .map(|(var_means, mean_count)| (var_means - sigma2 / mean_count).max(0.0))
        .collect();
    phi.push(sigma2);
    Ok(phi)
}

/// Fit a linear mixed model with crossed random intercepts by REML.
///
/// # Arguments
/// * `y` - Response values
/// * `design` - Fixed effects design matrix (X)
/// * `random` - One random-intercept design block per grouping factor
/// * `config` - LMM configuration
pub fn model_lmm(
    y: &[f64],
    design: &DesignMatrix,
    random: &[RandomDesignMatrix],
    config: &LmmConfig,
) -> Result<LmmFit> {
    let n = y.len();
    let p = design.n_coefficients();

    if design.n_samples() != n {
        return Err(PowerError::DimensionMismatch {
            expected: n,
            actual: design.n_samples(),
        });
    }
    for block in random {
        if block.n_samples() != n {
            return Err(PowerError::DimensionMismatch {
                expected: n,
                actual: block.n_samples(),
            });
        }
    }
    if n <= p {
        return Err(PowerError::FitFailure(
            "Model is saturated (n_obs <= n_fixed_effects)".to_string(),
        ));
    }

    let x = design.matrix();
    let y_vec = DVector::from_column_slice(y);

    let q: usize = random.iter().map(|b| b.n_groups).sum();
    let mut z = DMatrix::zeros(n, q);
    let mut blocks = Vec::with_capacity(random.len());
    let mut offset = 0;
    for block in random {
        z.view_mut((0, offset), (n, block.n_groups))
            .copy_from(block.matrix());
        blocks.push(offset..offset + block.n_groups);
        offset += block.n_groups;
    }

    let equations = MixedModelEquations::new(&y_vec, x, &z, blocks);
    let k = random.len();

    let mut phi = initial_estimates(&y_vec, x, random)?;
    let mut deviance_prev = f64::INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iter {
        iterations = iter + 1;

        let (lam, sigma2) = equations.relative_factors(&phi)?;
        let sol = equations.solve(&lam)?;
        let deviance = equations.deviance_from(&sol, sigma2);

        if !deviance.is_finite() {
            return Err(PowerError::FitFailure(format!(
                "REML deviance became non-finite at iteration {}",
                iterations
            )));
        }

        if (deviance_prev - deviance).abs() < config.tol {
            converged = true;
            break;
        }
        deviance_prev = deviance;

        phi = equations.em_step(&phi, &lam, &sol);
    }

    let (lam, sigma2) = equations.relative_factors(&phi)?;
    let sol = equations.solve(&lam)?;
    let deviance = equations.deviance_from(&sol, sigma2);
    let vcov = equations.vcov_from(&sol, sigma2);

    let theta: Vec<f64> = (0..k).map(|b| (phi[b].max(0.0) / sigma2).sqrt()).collect();
    let singular = theta.iter().any(|&t| t < config.singular_tol);

    let satterthwaite = match config.df_method {
        DfMethod::Satterthwaite => {
            let mut free: Vec<usize> = (0..k).filter(|&b| theta[b] >= config.singular_tol).collect();
            free.push(k);
            match equations.satterthwaite_terms(&phi, &free, config.derivative_step) {
                Ok(terms) => Some(terms),
                Err(e) => {
                    tracing::debug!(error = %e, "Satterthwaite terms unavailable; using residual df");
                    None
                }
            }
        }
        DfMethod::Residual => None,
    };

    let coefficients: Vec<f64> = sol.beta.iter().copied().collect();
    let std_errors: Vec<f64> = (0..p).map(|j| vcov[(j, j)].max(0.0).sqrt()).collect();

    let random_effects = random
        .iter()
        .zip(&phi)
        .map(|(block, &variance)| VarianceComponent {
            grouping: block.grouping.clone(),
            n_groups: block.n_groups,
            variance,
        })
        .collect();

    Ok(LmmFit {
        coefficient_names: design.coefficient_names().to_vec(),
        coefficients,
        std_errors,
        vcov,
        term_columns: design.term_columns().to_vec(),
        random_effects,
        sigma2,
        log_reml: -0.5 * deviance,
        df_residual: (n - p) as f64,
        n_obs: n,
        iterations,
        converged,
        singular,
        df_method: config.df_method,
        satterthwaite,
    })
}

/// Fit an LMM from a formula string and a dataset.
///
/// # Example
/// ```ignore
/// let fit = fit_lmm_from_formula(
///     &dataset,
///     "RT ~ type + (1 | participant) + (1 | item)",
///     None,
/// )?;
/// ```
pub fn fit_lmm_from_formula(
    dataset: &SimulatedDataset,
    formula: &str,
    config: Option<LmmConfig>,
) -> Result<LmmFit> {
    let mixed_formula = MixedFormula::parse(formula)?;
    fit_lmm(dataset, &mixed_formula, &config.unwrap_or_default())
}

/// Fit an LMM from a parsed formula.
///
/// Without random effects this reduces to ordinary least squares and the fit
/// reports no variance components.
pub fn fit_lmm(
    dataset: &SimulatedDataset,
    formula: &MixedFormula,
    config: &LmmConfig,
) -> Result<LmmFit> {
    let response = formula.response().unwrap_or(RESPONSE_COLUMN);
    let y = dataset.response(response)?;

    let design = DesignMatrix::from_formula(dataset, &formula.fixed)?;
    let random = formula
        .random
        .iter()
        .map(|re| RandomDesignMatrix::from_random_effect(dataset, re))
        .collect::<Result<Vec<_>>>()?;

    model_lmm(y, &design, &random, config)
}
