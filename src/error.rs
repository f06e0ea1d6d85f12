//! Error types for the composable-power library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum PowerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid model object: {0}")]
    InvalidModelObject(String),

    #[error("Sample size search exhausted after {iterations} iterations (best power {best_power:.3}): {reason}")]
    SearchExhausted {
        iterations: usize,
        best_power: f64,
        reason: String,
    },

    #[error("Model fit failed: {0}")]
    FitFailure(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Missing column '{0}' in dataset")]
    MissingColumn(String),

    #[error("Formula parse error: {0}")]
    FormulaParse(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, PowerError>;
