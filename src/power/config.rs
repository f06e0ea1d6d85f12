//! Serializable configuration for power simulations.

use crate::data::MixedFormula;
use crate::error::{PowerError, Result};
use crate::model::{LmmConfig, RemlBackend};
use crate::power::estimate::{FailurePolicy, PowerEstimator};
use crate::power::sweep::{
    configuration_grid, ConfigurationSweep, PowerTable, SearchOutcome, SearchPlan,
};
use crate::power::trial::TrialRunner;
use crate::simulate::GenerativeModel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Replicate count, significance level, seed and failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Replicates per configuration.
    pub replicates: usize,
    /// Significance level.
    pub alpha: f64,
    /// Base random seed.
    pub seed: u64,
    /// What to do when a fit fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl SimulationConfig {
    /// Create a config; alpha is always explicit.
    pub fn new(replicates: usize, alpha: f64) -> Self {
        Self {
            replicates,
            alpha,
            seed: 42,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Which configurations a sweep evaluates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPlan {
    /// Every participant count crossed with every item count.
    Grid {
        /// Participant counts.
        participants: Vec<usize>,
        /// Item counts.
        items: Vec<usize>,
    },
    /// Incremental search for the smallest sufficient size.
    Search(SearchPlan),
}

/// Result of running a [`SweepConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Table of a grid sweep, in grid order.
    Grid(PowerTable),
    /// Successful incremental search.
    Search(SearchOutcome),
}

impl SweepOutcome {
    /// All evaluated configurations.
    pub fn table(&self) -> &PowerTable {
        match self {
            SweepOutcome::Grid(table) => table,
            SweepOutcome::Search(outcome) => &outcome.history,
        }
    }
}

fn default_formula() -> String {
    MixedFormula::crossed_intercepts().formula_str
}

fn default_term() -> String {
    crate::data::TYPE_COLUMN.to_string()
}

/// A complete, file-backed power analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Assumed data-generating model.
    pub model: GenerativeModel,
    /// Model formula fitted to each replicate.
    #[serde(default = "default_formula")]
    pub formula: String,
    /// Fixed term whose omnibus test is counted.
    #[serde(default = "default_term")]
    pub term: String,
    /// REML settings.
    #[serde(default)]
    pub lmm: LmmConfig,
    /// Replicates, alpha and seed.
    pub simulation: SimulationConfig,
    /// Grid or search.
    pub plan: SweepPlan,
}

impl SweepConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(PowerError::from)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(PowerError::from)
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(PowerError::from)
    }

    /// Save to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(PowerError::from)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Build the estimator described by this config.
    pub fn estimator(&self) -> Result<PowerEstimator> {
        let formula = MixedFormula::parse(&self.formula)?;
        let runner = TrialRunner::new(
            formula,
            &self.term,
            Arc::new(RemlBackend::new(self.lmm.clone())),
        )?;
        Ok(PowerEstimator::new(runner)
            .with_seed(self.simulation.seed)
            .with_failure_policy(self.simulation.failure_policy))
    }

    /// Run the configured grid or search.
    pub fn run(&self) -> Result<SweepOutcome> {
        let sweep = ConfigurationSweep::new(
            self.estimator()?,
            self.model.clone(),
            self.simulation.replicates,
            self.simulation.alpha,
        )?;

        match &self.plan {
            SweepPlan::Grid {
                participants,
                items,
            } => {
                let grid = configuration_grid(participants, items);
                if grid.is_empty() {
                    return Err(PowerError::InvalidArgument(
                        "Grid has no configurations".to_string(),
                    ));
                }
                sweep.sweep_grid(&grid).map(SweepOutcome::Grid)
            }
            SweepPlan::Search(plan) => sweep.search_sample_size(plan).map(SweepOutcome::Search),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DfMethod;
    use crate::power::sweep::{SampleSizeConfiguration, SearchAxis};

    const YAML: &str = r#"
model:
  grand_mean: 800.0
  fixed_effects:
    - { level: Verb, offset: -20.0 }
    - { level: Noun, offset: 30.0 }
  sd_participant: 100.0
  sd_item: 80.0
  sd_residual: 200.0
simulation:
  replicates: 4
  alpha: 0.05
  seed: 7
plan:
  grid:
    participants: [4, 6]
    items: [4]
"#;

    #[test]
    fn test_from_yaml_defaults() {
        let config = SweepConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.formula, "RT ~ type + (1 | participant) + (1 | item)");
        assert_eq!(config.term, "type");
        assert_eq!(config.lmm.df_method, DfMethod::Satterthwaite);
        assert_eq!(config.simulation.failure_policy, FailurePolicy::Record);
        assert_eq!(config.model.levels(), vec!["Verb", "Noun"]);
    }

    #[test]
    fn test_yaml_json_round_trip() {
        let mut config = SweepConfig::from_yaml(YAML).unwrap();
        config.plan = SweepPlan::Search(SearchPlan::new(
            SearchAxis::Items,
            SampleSizeConfiguration::new(5, 5),
            2,
            0.9,
        ));

        let yaml = config.to_yaml().unwrap();
        let from_yaml = SweepConfig::from_yaml(&yaml).unwrap();
        assert_eq!(from_yaml.plan, config.plan);

        let json = config.to_json().unwrap();
        let from_json = SweepConfig::from_json(&json).unwrap();
        assert_eq!(from_json.simulation, config.simulation);
        assert_eq!(from_json.model, config.model);
    }

    #[test]
    fn test_run_grid() {
        let config = SweepConfig::from_yaml(YAML).unwrap();
        let outcome = config.run().unwrap();
        let table = outcome.table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.results[0].participants, 4);
        assert_eq!(table.results[1].participants, 6);
        assert!(table.iter().all(|r| r.replicates == 4 && r.seed == 7));
    }

    #[test]
    fn test_empty_grid() {
        let mut config = SweepConfig::from_yaml(YAML).unwrap();
        config.plan = SweepPlan::Grid {
            participants: vec![],
            items: vec![4],
        };
        assert!(matches!(config.run(), Err(PowerError::InvalidArgument(_))));
    }

    #[test]
    fn test_bad_formula() {
        let mut config = SweepConfig::from_yaml(YAML).unwrap();
        config.term = "condition".to_string();
        assert!(config.estimator().is_err());
    }
}
