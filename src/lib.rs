//! Composable Monte-Carlo power analysis for crossed mixed-model designs.
//!
//! Given an assumed data-generating model (fixed effects of a categorical `type`
//! factor, participant and item random-intercept variances, residual variance) and
//! a candidate sample size, the library estimates statistical power by repeated
//! simulation and sweeps candidate sizes to find one that meets a target.
//!
//! # Overview
//!
//! - **data**: Designs, simulated datasets, formulas and design matrices
//! - **simulate**: Generative model and response simulation
//! - **model**: REML fitting of linear mixed models with crossed random intercepts
//! - **test**: Omnibus F and Wald tests with Satterthwaite degrees of freedom
//! - **power**: Trial runner, power estimator, grid sweep and incremental search
//!
//! # Example
//!
//! ```no_run
//! use composable_power::prelude::*;
//!
//! let model = GenerativeModel::new(
//!     800.0,
//!     [("Verb", -20.0), ("Noun", 30.0), ("Adj", 10.0), ("Adv", -10.0)],
//!     100.0,
//!     80.0,
//!     200.0,
//! )
//! .unwrap();
//!
//! let result = PowerEstimator::default()
//!     .with_seed(2024)
//!     .estimate(10, 10, &model, 1000, 0.01)
//!     .unwrap();
//! println!("power = {:.3} ± {:.3}", result.power, result.mc_standard_error());
//! ```

pub mod data;
pub mod error;
pub mod model;
pub mod power;
pub mod simulate;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::data::{
        generate_design, Design, DesignMatrix, DesignRow, Formula, MixedFormula,
        RandomDesignMatrix, RandomEffect, SimulatedDataset,
    };
    pub use crate::error::{PowerError, Result};
    pub use crate::model::{
        fit_lmm, fit_lmm_from_formula, DfMethod, LmmConfig, LmmFit, MixedModelBackend,
        RemlBackend, VarianceComponent,
    };
    pub use crate::power::{
        configuration_grid, power_from_p_values, ConfigurationSweep, ConvergenceStatus,
        FailurePolicy, PowerEstimator, PowerResult, PowerTable, SampleSizeConfiguration,
        SearchAxis, SearchOutcome, SearchPlan, SimulationConfig, SweepConfig, SweepOutcome,
        SweepPlan, TrialOutcome, TrialRunner,
    };
    pub use crate::simulate::{
        draw_random_effects, replicate_rng, simulate_responses, GenerativeModel,
        RandomEffectDraw,
    };
    pub use crate::test::{anova_lmm, test_f_lmm, test_wald_lmm, FTestResult, WaldResult};
}
