//! Hypothesis tests on fitted mixed models.

pub mod ftest;

pub use ftest::{anova_lmm, test_f_lmm, test_wald_lmm, FTestResult, WaldResult};
