//! Synthetic data generation under an assumed mixed model.

mod model;
mod response;

pub use model::{FixedEffect, GenerativeModel};
pub use response::{draw_random_effects, replicate_rng, simulate_responses, RandomEffectDraw};
