//! Omnibus F tests for fixed-effect terms of a mixed model.

use crate::error::{PowerError, Result};
use crate::model::{satterthwaite_df, DfMethod, LmmFit};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};

/// Result of an F test for one fixed-effect term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FTestResult {
    /// Term being tested (e.g. "type").
    pub term: String,
    /// Wald F statistic.
    pub f_statistic: f64,
    /// Numerator degrees of freedom (number of coefficients in the term).
    pub num_df: usize,
    /// Denominator degrees of freedom.
    pub den_df: f64,
    /// Upper-tail p-value.
    pub p_value: f64,
    /// Whether `den_df` came from the Satterthwaite approximation.
    pub satterthwaite: bool,
}

/// Result of a Wald t test for one coefficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaldResult {
    /// Coefficient name.
    pub coefficient: String,
    /// Estimated coefficient value.
    pub estimate: f64,
    /// Standard error.
    pub std_error: f64,
    /// t statistic.
    pub statistic: f64,
    /// Degrees of freedom.
    pub df: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

/// Denominator df for a set of columns, falling back to residual df.
fn denominator_df(fit: &LmmFit, columns: &[usize]) -> (f64, bool) {
    if fit.df_method == DfMethod::Satterthwaite {
        if let Some(df) = satterthwaite_df(fit, columns) {
            return (df, true);
        }
        tracing::debug!("Satterthwaite df unavailable; using residual df");
    }
    (fit.df_residual, false)
}

/// F test of `H0: all coefficients of term = 0`.
///
/// `F = β_T' V_T⁻¹ β_T / q` with `q` the number of coefficients in the term.
pub fn test_f_lmm(fit: &LmmFit, term: &str) -> Result<FTestResult> {
    let columns = &fit
        .term(term)
        .ok_or_else(|| {
            PowerError::InvalidArgument(format!(
                "Term '{}' not found. Available: {:?}",
                term,
                fit.term_columns.iter().map(|t| &t.term).collect::<Vec<_>>()
            ))
        })?
        .columns;
    let q = columns.len();
    if q == 0 {
        return Err(PowerError::InvalidArgument(format!(
            "Term '{}' has no coefficients",
            term
        )));
    }

    let beta = DVector::from_iterator(q, columns.iter().map(|&c| fit.coefficients[c]));
    let v_term = DMatrix::from_fn(q, q, |a, b| fit.vcov[(columns[a], columns[b])]);
    let chol = v_term.cholesky().ok_or_else(|| {
        PowerError::Numerical(format!(
            "Covariance of term '{}' is not positive definite",
            term
        ))
    })?;
    let f_statistic = beta.dot(&chol.solve(&beta)) / q as f64;
    if !f_statistic.is_finite() {
        return Err(PowerError::Numerical(format!(
            "F statistic for term '{}' is not finite",
            term
        )));
    }

    let (den_df, satterthwaite) = denominator_df(fit, columns);
    let dist = FisherSnedecor::new(q as f64, den_df)
        .map_err(|e| PowerError::Numerical(format!("F distribution: {}", e)))?;
    let p_value = dist.sf(f_statistic).clamp(0.0, 1.0);

    Ok(FTestResult {
        term: term.to_string(),
        f_statistic,
        num_df: q,
        den_df,
        p_value,
        satterthwaite,
    })
}

/// F tests for every fixed-effect term, in formula order.
pub fn anova_lmm(fit: &LmmFit) -> Result<Vec<FTestResult>> {
    fit.term_columns
        .iter()
        .map(|t| test_f_lmm(fit, &t.term))
        .collect()
}

/// Wald t test of `H0: β = 0` for a single coefficient.
pub fn test_wald_lmm(fit: &LmmFit, coefficient: &str) -> Result<WaldResult> {
    let idx = fit.coefficient_index(coefficient).ok_or_else(|| {
        PowerError::InvalidArgument(format!(
            "Coefficient '{}' not found. Available: {:?}",
            coefficient, fit.coefficient_names
        ))
    })?;

    let estimate = fit.coefficients[idx];
    let std_error = fit.std_errors[idx];
    let statistic = if std_error > 0.0 {
        estimate / std_error
    } else {
        f64::NAN
    };

    let (df, _) = denominator_df(fit, &[idx]);
    let p_value = if statistic.is_finite() {
        let t_dist = StudentsT::new(0.0, 1.0, df)
            .map_err(|e| PowerError::Numerical(format!("t distribution: {}", e)))?;
        (2.0 * t_dist.sf(statistic.abs())).min(1.0)
    } else {
        f64::NAN
    };

    Ok(WaldResult {
        coefficient: coefficient.to_string(),
        estimate,
        std_error,
        statistic,
        df,
        p_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::generate_design;
    use crate::model::{fit_lmm_from_formula, LmmConfig};
    use crate::simulate::{replicate_rng, simulate_responses, GenerativeModel};
    use approx::assert_relative_eq;

    const FORMULA: &str = "RT ~ type + (1 | participant) + (1 | item)";

    fn fit_with(effects: [f64; 4], seed: u64, config: Option<LmmConfig>) -> LmmFit {
        let model = GenerativeModel::new(
            800.0,
            [
                ("Verb", effects[0]),
                ("Noun", effects[1]),
                ("Adj", effects[2]),
                ("Adv", effects[3]),
            ],
            100.0,
            80.0,
            200.0,
        )
        .unwrap();
        let design = generate_design(10, 10, &model.levels()).unwrap();
        let data = simulate_responses(&design, &model, &mut replicate_rng(seed, 0, 0)).unwrap();
        fit_lmm_from_formula(&data, FORMULA, config).unwrap()
    }

    #[test]
    fn test_f_structure() {
        let fit = fit_with([-20.0, 30.0, 10.0, -10.0], 1, None);
        let result = test_f_lmm(&fit, "type").unwrap();
        assert_eq!(result.term, "type");
        assert_eq!(result.num_df, 3);
        assert!(result.satterthwaite);
        assert!(result.f_statistic >= 0.0);
        assert!(result.p_value >= 0.0 && result.p_value <= 1.0);
    }

    #[test]
    fn test_large_effect_is_significant() {
        let fit = fit_with([-200.0, 300.0, 100.0, -100.0], 2, None);
        let result = test_f_lmm(&fit, "type").unwrap();
        assert!(result.p_value < 1e-6, "p = {}", result.p_value);
    }

    #[test]
    fn test_single_df_f_matches_squared_t() {
        let fit = fit_with([-20.0, 30.0, 10.0, -10.0], 3, None);
        let wald = test_wald_lmm(&fit, "typeNoun").unwrap();

        // Build a one-column term by hand through the same machinery.
        let mut single = fit.clone();
        single.term_columns = vec![crate::data::TermColumns {
            term: "noun".to_string(),
            columns: vec![1],
        }];
        let f = test_f_lmm(&single, "noun").unwrap();

        assert_relative_eq!(f.f_statistic, wald.statistic.powi(2), epsilon = 1e-9);
        assert_relative_eq!(f.p_value, wald.p_value, epsilon = 1e-6);
    }

    #[test]
    fn test_residual_df_method() {
        let config = LmmConfig::default().with_df_method(DfMethod::Residual);
        let fit = fit_with([-20.0, 30.0, 10.0, -10.0], 4, Some(config));
        let result = test_f_lmm(&fit, "type").unwrap();
        assert!(!result.satterthwaite);
        assert_eq!(result.den_df, 396.0);
    }

    #[test]
    fn test_anova_lists_terms() {
        let fit = fit_with([0.0; 4], 5, None);
        let table = anova_lmm(&fit).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].term, "type");
    }

    #[test]
    fn test_unknown_term() {
        let fit = fit_with([0.0; 4], 6, None);
        assert!(matches!(
            test_f_lmm(&fit, "condition"),
            Err(PowerError::InvalidArgument(_))
        ));
        assert!(test_wald_lmm(&fit, "typePronoun").is_err());
    }
}
