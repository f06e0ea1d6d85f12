//! Monte-Carlo power estimation at one sample-size configuration.

use crate::data::generate_design;
use crate::error::{PowerError, Result};
use crate::power::sweep::SampleSizeConfiguration;
use crate::power::trial::{rejects_null, ConvergenceStatus, TrialOutcome, TrialRunner};
use crate::simulate::{replicate_rng, simulate_responses, GenerativeModel};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// What to do when a replicate's model fit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Count the replicate as a non-rejection and tally it as failed.
    ///
    /// Failed replicates stay in the denominator, so power at `alpha = 1`
    /// is the share of replicates that fitted.
    #[default]
    Record,
    /// Abort the estimate with the fit error.
    Propagate,
}

/// Estimated power at one configuration, with fit diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerResult {
    /// Number of participants.
    pub participants: usize,
    /// Number of items.
    pub items: usize,
    /// Proportion of replicates rejecting the null.
    pub power: f64,
    /// Number of replicates.
    pub replicates: usize,
    /// Number of rejecting replicates.
    pub rejections: usize,
    /// Replicates whose fit converged.
    pub converged: usize,
    /// Replicates with a singular fit.
    pub singular: usize,
    /// Replicates whose fit hit the iteration ceiling.
    pub not_converged: usize,
    /// Replicates whose fit failed outright.
    pub failed: usize,
    /// Significance level.
    pub alpha: f64,
    /// Base seed.
    pub seed: u64,
}

impl PowerResult {
    /// The sample-size configuration this result belongs to.
    pub fn configuration(&self) -> SampleSizeConfiguration {
        SampleSizeConfiguration::new(self.participants, self.items)
    }

    /// Monte-Carlo standard error `sqrt(p (1 - p) / R)`.
    pub fn mc_standard_error(&self) -> f64 {
        (self.power * (1.0 - self.power) / self.replicates as f64).sqrt()
    }

    /// Wilson score interval for the power at the given confidence level.
    pub fn wilson_interval(&self, confidence: f64) -> Result<(f64, f64)> {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(PowerError::InvalidArgument(format!(
                "Confidence must be in (0, 1), got {}",
                confidence
            )));
        }
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| PowerError::Numerical(format!("normal distribution: {}", e)))?;
        let z = normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0);

        let n = self.replicates as f64;
        let p = self.power;
        let z2 = z * z;
        let denom = 1.0 + z2 / n;
        let center = (p + z2 / (2.0 * n)) / denom;
        let half = z / denom * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();

        Ok(((center - half).max(0.0), (center + half).min(1.0)))
    }

    /// Number of replicates that produced a usable p-value.
    pub fn successful(&self) -> usize {
        self.replicates - self.failed
    }
}

/// Check `replicates ≥ 1` and `alpha ∈ [0, 1]`.
pub(crate) fn validate_run(replicates: usize, alpha: f64) -> Result<()> {
    if replicates == 0 {
        return Err(PowerError::InvalidArgument(
            "replicates must be at least 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&alpha) {
        return Err(PowerError::InvalidArgument(format!(
            "alpha must be in [0, 1], got {}",
            alpha
        )));
    }
    Ok(())
}

/// Rejection rate of a set of p-values at `alpha`.
///
/// A pure count, so the result does not depend on the order of `p_values`.
pub fn power_from_p_values(p_values: &[f64], alpha: f64) -> Result<f64> {
    validate_run(p_values.len(), alpha)?;
    Ok(count_rejections(p_values, alpha) as f64 / p_values.len() as f64)
}

/// Number of p-values rejecting at `alpha`.
pub(crate) fn count_rejections(p_values: &[f64], alpha: f64) -> usize {
    p_values.iter().filter(|&&p| rejects_null(p, alpha)).count()
}

/// Check that a model can carry an omnibus test of `type`.
pub(crate) fn validate_power_model(model: &GenerativeModel) -> Result<()> {
    model.validate()?;
    if model.fixed_effects.len() < 2 {
        return Err(PowerError::InvalidArgument(format!(
            "Power analysis needs at least two levels of type, got {}",
            model.fixed_effects.len()
        )));
    }
    Ok(())
}

/// Repeats trials at a configuration and reduces them to a rejection rate.
#[derive(Debug, Clone)]
pub struct PowerEstimator {
    runner: TrialRunner,
    seed: u64,
    failure_policy: FailurePolicy,
}

impl Default for PowerEstimator {
    fn default() -> Self {
        Self::new(TrialRunner::default())
    }
}

impl PowerEstimator {
    /// Create an estimator with seed 42 and [`FailurePolicy::Record`].
    pub fn new(runner: TrialRunner) -> Self {
        Self {
            runner,
            seed: 42,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Set the base seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Base seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The trial runner.
    pub fn runner(&self) -> &TrialRunner {
        &self.runner
    }

    /// Estimate power for `participants × items` under `model`.
    ///
    /// # Errors
    /// `InvalidArgument` for zero counts, `replicates == 0`, `alpha` outside
    /// `[0, 1]` or a model with fewer than two levels; the first fit error under [`FailurePolicy::Propagate`].
    pub fn estimate(
        &self,
        participants: usize,
        items: usize,
        model: &GenerativeModel,
        replicates: usize,
        alpha: f64,
    ) -> Result<PowerResult> {
        self.estimate_stream(
            SampleSizeConfiguration::new(participants, items),
            model,
            replicates,
            alpha,
            0,
        )
    }

    /// Estimate on a given random stream; sweeps give each configuration its own.
    pub(crate) fn estimate_stream(
        &self,
        configuration: SampleSizeConfiguration,
        model: &GenerativeModel,
        replicates: usize,
        alpha: f64,
        stream: u64,
    ) -> Result<PowerResult> {
        validate_run(replicates, alpha)?;
        validate_power_model(model)?;
        let design = generate_design(configuration.participants, configuration.items, &model.levels())?;

        tracing::debug!(
            participants = configuration.participants,
            items = configuration.items,
            replicates,
            alpha,
            stream,
            "estimating power"
        );

        let outcomes: Vec<Result<TrialOutcome>> = (0..replicates)
            .into_par_iter()
            .map(|replicate| {
                let mut rng = replicate_rng(self.seed, stream, replicate as u64);
                let dataset = simulate_responses(&design, model, &mut rng)?;
                self.runner.run(&dataset)
            })
            .collect();

        let mut result = PowerResult {
            participants: configuration.participants,
            items: configuration.items,
            power: 0.0,
            replicates,
            rejections: 0,
            converged: 0,
            singular: 0,
            not_converged: 0,
            failed: 0,
            alpha,
            seed: self.seed,
        };

        let mut p_values = Vec::with_capacity(replicates);
        for (replicate, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(outcome) => {
                    match outcome.status {
                        ConvergenceStatus::Converged => result.converged += 1,
                        ConvergenceStatus::Singular => result.singular += 1,
                        ConvergenceStatus::NotConverged => result.not_converged += 1,
                    }
                    p_values.push(outcome.p_value);
                }
                Err(PowerError::FitFailure(msg))
                    if self.failure_policy == FailurePolicy::Record =>
                {
                    tracing::debug!(replicate, error = %msg, "fit failed");
                    result.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        result.rejections = count_rejections(&p_values, alpha);
        result.power = result.rejections as f64 / replicates as f64;

        if result.failed > 0 {
            tracing::warn!(
                participants = result.participants,
                items = result.items,
                failed = result.failed,
                replicates,
                "some replicate fits failed and were counted as non-rejections"
            );
        }
        tracing::debug!(
            participants = result.participants,
            items = result.items,
            power = result.power,
            singular = result.singular,
            "power estimated"
        );

        Ok(result)
    }
}
