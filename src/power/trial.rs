//! One simulated trial: fit the mixed model and extract the omnibus p-value.

use crate::data::{MixedFormula, SimulatedDataset, TYPE_COLUMN};
use crate::error::{PowerError, Result};
use crate::model::{LmmFit, MixedModelBackend, RemlBackend};
use crate::test::test_f_lmm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Convergence classification of a fitted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    /// Optimiser converged to an interior estimate.
    Converged,
    /// A random-effect variance sits on the boundary.
    Singular,
    /// Optimiser hit its iteration ceiling.
    NotConverged,
}

impl ConvergenceStatus {
    /// Classify a fit. Singularity takes precedence over non-convergence.
    pub fn from_fit(fit: &LmmFit) -> Self {
        if fit.singular {
            ConvergenceStatus::Singular
        } else if !fit.converged {
            ConvergenceStatus::NotConverged
        } else {
            ConvergenceStatus::Converged
        }
    }
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConvergenceStatus::Converged => "converged",
            ConvergenceStatus::Singular => "singular",
            ConvergenceStatus::NotConverged => "not_converged",
        };
        write!(f, "{}", label)
    }
}

/// Result of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    /// Omnibus p-value of the tested term, in [0, 1].
    pub p_value: f64,
    /// Convergence classification.
    pub status: ConvergenceStatus,
    /// F statistic.
    pub f_statistic: f64,
    /// Numerator degrees of freedom.
    pub num_df: usize,
    /// Denominator degrees of freedom.
    pub den_df: f64,
}

impl TrialOutcome {
    /// Whether the null hypothesis is rejected at `alpha`.
    ///
    /// See [`rejects_null`]. Only trials that produced a p-value can reject;
    /// a replicate whose fit failed never does, even at `alpha = 1`.
    pub fn rejects(&self, alpha: f64) -> bool {
        rejects_null(self.p_value, alpha)
    }
}

/// Rejection rule shared by single trials and power estimates.
///
/// `alpha = 1` rejects every p-value, so that level is always attainable.
pub fn rejects_null(p_value: f64, alpha: f64) -> bool {
    p_value < alpha || alpha >= 1.0
}

/// Fits a mixed model to one dataset and tests one fixed-effect term.
#[derive(Clone)]
pub struct TrialRunner {
    formula: MixedFormula,
    term: String,
    backend: Arc<dyn MixedModelBackend>,
}

impl fmt::Debug for TrialRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialRunner")
            .field("formula", &self.formula.formula_str)
            .field("term", &self.term)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Default for TrialRunner {
    /// `RT ~ type + (1 | participant) + (1 | item)`, testing `type` with REML.
    fn default() -> Self {
        Self {
            formula: MixedFormula::crossed_intercepts(),
            term: TYPE_COLUMN.to_string(),
            backend: Arc::new(RemlBackend::default()),
        }
    }
}

impl TrialRunner {
    /// Create a runner for `term` of `formula`.
    ///
    /// # Errors
    /// `InvalidArgument` if the formula has no random effects or does not contain `term`.
    pub fn new(
        formula: MixedFormula,
        term: &str,
        backend: Arc<dyn MixedModelBackend>,
    ) -> Result<Self> {
        if !formula.has_random_effects() {
            return Err(PowerError::InvalidArgument(format!(
                "Formula '{}' has no random effects",
                formula
            )));
        }
        if !formula.fixed.terms.iter().any(|t| t.to_string() == term) {
            return Err(PowerError::InvalidArgument(format!(
                "Term '{}' is not a fixed term of '{}'",
                term, formula
            )));
        }
        Ok(Self {
            formula,
            term: term.to_string(),
            backend,
        })
    }

    /// Default formula and term with a different back-end.
    pub fn with_backend(backend: Arc<dyn MixedModelBackend>) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// The model formula.
    pub fn formula(&self) -> &MixedFormula {
        &self.formula
    }

    /// The tested term.
    pub fn term(&self) -> &str {
        &self.term
    }

    /// The fitting back-end.
    pub fn backend(&self) -> &dyn MixedModelBackend {
        self.backend.as_ref()
    }

    /// Fit the model to `dataset` and test the term.
    ///
    /// # Errors
    /// `FitFailure` if the back-end fails; `InvalidModelObject` if the fit is not a
    /// mixed model or has no test for the term.
    pub fn run(&self, dataset: &SimulatedDataset) -> Result<TrialOutcome> {
        let fit = self
            .backend
            .fit(dataset, &self.formula)
            .map_err(|e| match e {
                PowerError::FitFailure(_) => e,
                other => PowerError::FitFailure(format!(
                    "{} back-end: {}",
                    self.backend.name(),
                    other
                )),
            })?;
        self.outcome(&fit)
    }

    /// Extract the outcome from an already fitted model.
    pub fn outcome(&self, fit: &LmmFit) -> Result<TrialOutcome> {
        if !fit.is_mixed() {
            return Err(PowerError::InvalidModelObject(
                "Fit has no random-effect components".to_string(),
            ));
        }
        if fit.term(&self.term).is_none() {
            return Err(PowerError::InvalidModelObject(format!(
                "Fit carries no omnibus test for term '{}'",
                self.term
            )));
        }

        let test = test_f_lmm(fit, &self.term)
            .map_err(|e| PowerError::FitFailure(format!("F test: {}", e)))?;

        Ok(TrialOutcome {
            p_value: test.p_value,
            status: ConvergenceStatus::from_fit(fit),
            f_statistic: test.f_statistic,
            num_df: test.num_df,
            den_df: test.den_df,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{generate_design, TermColumns};
    use crate::model::fit_lmm_from_formula;
    use crate::simulate::{replicate_rng, simulate_responses, GenerativeModel};

    fn dataset(seed: u64) -> SimulatedDataset {
        let model = GenerativeModel::new(
            800.0,
            [("Verb", -20.0), ("Noun", 30.0), ("Adj", 10.0), ("Adv", -10.0)],
            100.0,
            80.0,
            200.0,
        )
        .unwrap();
        let design = generate_design(10, 10, &model.levels()).unwrap();
        simulate_responses(&design, &model, &mut replicate_rng(seed, 0, 0)).unwrap()
    }

    struct FixedOnly;

    impl MixedModelBackend for FixedOnly {
        fn name(&self) -> &str {
            "fixed-only"
        }

        fn fit(&self, dataset: &SimulatedDataset, _formula: &MixedFormula) -> Result<LmmFit> {
            fit_lmm_from_formula(dataset, "RT ~ type", None)
        }
    }

    struct Failing;

    impl MixedModelBackend for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn fit(&self, _dataset: &SimulatedDataset, _formula: &MixedFormula) -> Result<LmmFit> {
            Err(PowerError::Numerical("matrix exploded".to_string()))
        }
    }

    #[test]
    fn test_default_runner() {
        let runner = TrialRunner::default();
        assert_eq!(runner.term(), "type");
        assert_eq!(runner.backend().name(), "reml");

        let outcome = runner.run(&dataset(1)).unwrap();
        assert!(outcome.p_value >= 0.0 && outcome.p_value <= 1.0);
        assert_eq!(outcome.num_df, 3);
        assert!(outcome.den_df > 0.0);
    }

    #[test]
    fn test_status_precedence() {
        let mut fit = fit_lmm_from_formula(
            &dataset(2),
            "RT ~ type + (1 | participant) + (1 | item)",
            None,
        )
        .unwrap();
        fit.converged = true;
        fit.singular = false;
        assert_eq!(ConvergenceStatus::from_fit(&fit), ConvergenceStatus::Converged);
        fit.converged = false;
        assert_eq!(ConvergenceStatus::from_fit(&fit), ConvergenceStatus::NotConverged);
        fit.singular = true;
        assert_eq!(ConvergenceStatus::from_fit(&fit), ConvergenceStatus::Singular);
    }

    #[test]
    fn test_non_mixed_fit_rejected() {
        let runner = TrialRunner::with_backend(Arc::new(FixedOnly));
        assert!(matches!(
            runner.run(&dataset(3)),
            Err(PowerError::InvalidModelObject(_))
        ));
    }

    #[test]
    fn test_missing_term_rejected() {
        let runner = TrialRunner::default();
        let mut fit = fit_lmm_from_formula(
            &dataset(4),
            "RT ~ type + (1 | participant) + (1 | item)",
            None,
        )
        .unwrap();
        fit.term_columns = vec![TermColumns {
            term: "condition".to_string(),
            columns: vec![1],
        }];
        assert!(matches!(
            runner.outcome(&fit),
            Err(PowerError::InvalidModelObject(_))
        ));
    }

    #[test]
    fn test_backend_errors_become_fit_failures() {
        let runner = TrialRunner::with_backend(Arc::new(Failing));
        match runner.run(&dataset(5)) {
            Err(PowerError::FitFailure(msg)) => assert!(msg.contains("failing")),
            other => panic!("expected FitFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_new_validates_formula() {
        let backend: Arc<dyn MixedModelBackend> = Arc::new(RemlBackend::default());
        let no_random = MixedFormula::parse("RT ~ type").unwrap();
        assert!(TrialRunner::new(no_random, "type", backend.clone()).is_err());

        let formula = MixedFormula::crossed_intercepts();
        assert!(TrialRunner::new(formula.clone(), "condition", backend.clone()).is_err());
        assert!(TrialRunner::new(formula, "type", backend).is_ok());
    }

    #[test]
    fn test_rejection_boundaries() {
        let outcome = TrialOutcome {
            p_value: 0.0,
            status: ConvergenceStatus::Converged,
            f_statistic: 1e9,
            num_df: 3,
            den_df: 100.0,
        };
        assert!(!outcome.rejects(0.0));
        assert!(outcome.rejects(0.05));

        let flat = TrialOutcome { p_value: 1.0, ..outcome };
        assert!(!flat.rejects(0.99));
        assert!(flat.rejects(1.0));
        assert_eq!(flat.rejects(0.5), rejects_null(1.0, 0.5));
        assert!(rejects_null(f64::NAN, 1.0));
        assert!(!rejects_null(f64::NAN, 0.05));
    }
}
