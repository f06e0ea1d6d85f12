//! Data structures: designs, datasets, formulas and design matrices.

mod dataset;
mod design;
mod design_matrix;
mod formula;
mod random_effects;

pub use dataset::{
    Factor, SimulatedDataset, ITEM_COLUMN, PARTICIPANT_COLUMN, RESPONSE_COLUMN, TYPE_COLUMN,
};
pub use design::{generate_design, Design, DesignRow};
pub use design_matrix::{DesignMatrix, TermColumns};
pub use formula::{Formula, Term};
pub use random_effects::{MixedFormula, RandomDesignMatrix, RandomEffect};
