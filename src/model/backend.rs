//! Pluggable mixed-model fitting back-ends.

use crate::data::{MixedFormula, SimulatedDataset};
use crate::error::Result;
use crate::model::lmm::{fit_lmm, LmmConfig, LmmFit};

/// Something that can fit a linear mixed model to one simulated dataset.
///
/// Back-ends are shared across worker threads, so they must be `Send + Sync`.
pub trait MixedModelBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fit `formula` to `dataset`.
    fn fit(&self, dataset: &SimulatedDataset, formula: &MixedFormula) -> Result<LmmFit>;
}

/// REML back-end for crossed random intercepts.
#[derive(Debug, Clone, Default)]
pub struct RemlBackend {
    config: LmmConfig,
}

impl RemlBackend {
    /// Create a back-end with the given fitting configuration.
    pub fn new(config: LmmConfig) -> Self {
        Self { config }
    }

    /// Fitting configuration.
    pub fn config(&self) -> &LmmConfig {
        &self.config
    }
}

impl MixedModelBackend for RemlBackend {
    fn name(&self) -> &str {
        "reml"
    }

    fn fit(&self, dataset: &SimulatedDataset, formula: &MixedFormula) -> Result<LmmFit> {
        fit_lmm(dataset, formula, &self.config)
    }
}
