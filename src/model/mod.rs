//! Linear mixed models and fitting back-ends.

pub mod backend;
pub mod lmm;
pub mod satterthwaite;

pub use backend::{MixedModelBackend, RemlBackend};
pub use lmm::{
    fit_lmm, fit_lmm_from_formula, model_lmm, DfMethod, LmmConfig, LmmFit, SatterthwaiteTerms,
    VarianceComponent,
};
pub use satterthwaite::satterthwaite_df;
