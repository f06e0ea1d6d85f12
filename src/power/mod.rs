//! Monte-Carlo power analysis: trials, estimation and sample-size sweeps.

pub mod config;
pub mod estimate;
pub mod sweep;
pub mod trial;

pub use config::{SimulationConfig, SweepConfig, SweepOutcome, SweepPlan};
pub use estimate::{power_from_p_values, FailurePolicy, PowerEstimator, PowerResult};
pub use sweep::{
    configuration_grid, ConfigurationSweep, PowerTable, SampleSizeConfiguration, SearchAxis,
    SearchOutcome, SearchPlan,
};
pub use trial::{rejects_null, ConvergenceStatus, TrialOutcome, TrialRunner};
