//! Response simulation: random intercepts plus residual noise over a design.

use crate::data::{Design, SimulatedDataset};
use crate::error::{PowerError, Result};
use crate::simulate::GenerativeModel;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::BTreeMap;

/// Realized random intercepts for one replicate.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomEffectDraw {
    /// Participant id -> intercept.
    pub participant: BTreeMap<usize, f64>,
    /// Item id -> intercept.
    pub item: BTreeMap<usize, f64>,
}

/// Seeded generator for one replicate.
///
/// The seed selects the key, `stream` the ChaCha stream (e.g. the configuration
/// index) and `replicate` the block offset within it, so every replicate gets a
/// disjoint sequence no matter which thread draws it.
pub fn replicate_rng(seed: u64, stream: u64, replicate: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    // 2^40 words per replicate is far beyond what one dataset consumes.
    rng.set_word_pos(u128::from(replicate) << 40);
    rng
}

fn normal<R: Rng>(rng: &mut R, sd: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    sd * z
}

/// Draw one intercept per distinct participant, then one per distinct item.
///
/// Ids are visited in ascending order so the draw is a pure function of the RNG state.
pub fn draw_random_effects<R: Rng>(
    design: &Design,
    model: &GenerativeModel,
    rng: &mut R,
) -> RandomEffectDraw {
    let participant = design
        .participant_ids()
        .into_iter()
        .map(|id| (id, normal(rng, model.sd_participant)))
        .collect();
    let item = design
        .item_ids()
        .into_iter()
        .map(|id| (id, normal(rng, model.sd_item)))
        .collect();
    RandomEffectDraw { participant, item }
}

/// Simulate `RT` for every row of `design` under `model`.
///
/// Draw order: participant intercepts, item intercepts, then one residual per
/// row in row order. Row order is preserved in the output.
///
/// # Errors
/// `InvalidArgument` if the design contains a level with no fixed effect in the model.
pub fn simulate_responses<R: Rng>(
    design: &Design,
    model: &GenerativeModel,
    rng: &mut R,
) -> Result<SimulatedDataset> {
    // Resolve level offsets up front so the row loop is a plain lookup.
    let offsets: Vec<f64> = design
        .levels()
        .iter()
        .map(|label| {
            model.offset(label).ok_or_else(|| {
                PowerError::InvalidArgument(format!(
                    "Level '{}' has no fixed effect in the generative model",
                    label
                ))
            })
        })
        .collect::<Result<_>>()?;

    let draw = draw_random_effects(design, model, rng);

    let rt: Vec<f64> = design
        .rows()
        .iter()
        .map(|row| {
            model.grand_mean
                + offsets[row.level]
                + draw.participant[&row.participant]
                + draw.item[&row.item]
                + normal(rng, model.sd_residual)
        })
        .collect();

    SimulatedDataset::new(design.clone(), rt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::generate_design;
    use approx::assert_relative_eq;

    fn word_types() -> GenerativeModel {
        GenerativeModel::new(
            800.0,
            [("Verb", -20.0), ("Noun", 30.0), ("Adj", 10.0), ("Adv", -10.0)],
            100.0,
            80.0,
            200.0,
        )
        .unwrap()
    }

    #[test]
    fn test_deterministic_given_seed() {
        let design = generate_design(10, 10, &word_types().levels()).unwrap();
        let a = simulate_responses(&design, &word_types(), &mut replicate_rng(7, 0, 3)).unwrap();
        let b = simulate_responses(&design, &word_types(), &mut replicate_rng(7, 0, 3)).unwrap();
        assert_eq!(a.rt(), b.rt());
    }

    #[test]
    fn test_replicates_differ() {
        let design = generate_design(5, 5, &word_types().levels()).unwrap();
        let a = simulate_responses(&design, &word_types(), &mut replicate_rng(7, 0, 0)).unwrap();
        let b = simulate_responses(&design, &word_types(), &mut replicate_rng(7, 0, 1)).unwrap();
        let c = simulate_responses(&design, &word_types(), &mut replicate_rng(7, 1, 0)).unwrap();
        assert_ne!(a.rt(), b.rt());
        assert_ne!(a.rt(), c.rt());
    }

    #[test]
    fn test_row_order_preserved() {
        let design = generate_design(3, 4, &["a", "b"]).unwrap();
        let model = GenerativeModel::new(0.0, [("a", 0.0), ("b", 0.0)], 1.0, 1.0, 1.0).unwrap();
        let data = simulate_responses(&design, &model, &mut replicate_rng(1, 0, 0)).unwrap();
        assert_eq!(data.design().rows(), design.rows());
        assert_eq!(data.n_rows(), 24);
    }

    #[test]
    fn test_no_noise_is_exact() {
        let design = generate_design(3, 3, &["a", "b"]).unwrap();
        let model = GenerativeModel::new(500.0, [("a", -5.0), ("b", 5.0)], 0.0, 0.0, 0.0).unwrap();
        let data = simulate_responses(&design, &model, &mut replicate_rng(1, 0, 0)).unwrap();
        for (row, rt) in data.iter() {
            let expected = if row.level == 0 { 495.0 } else { 505.0 };
            assert_relative_eq!(rt, expected);
        }
    }

    #[test]
    fn test_residual_only_variance() {
        // Zero fixed effects and zero random sds: RT = grand mean + residual.
        let sigma = 200.0;
        let design = generate_design(30, 30, &["a", "b", "c", "d"]).unwrap();
        let model = GenerativeModel::new(
            800.0,
            [("a", 0.0), ("b", 0.0), ("c", 0.0), ("d", 0.0)],
            0.0,
            0.0,
            sigma,
        )
        .unwrap();
        let data = simulate_responses(&design, &model, &mut replicate_rng(11, 0, 0)).unwrap();
        let (mean, var) = data.response_moments();
        // 3600 observations: the variance estimate is within a few percent of sigma².
        assert!((mean - 800.0).abs() < 15.0, "mean {}", mean);
        assert!((var / (sigma * sigma) - 1.0).abs() < 0.1, "variance {}", var);
    }

    #[test]
    fn test_random_intercepts_shared_within_group() {
        // Only participant variance: all rows of a participant share one value.
        let design = generate_design(4, 5, &["a"]).unwrap();
        let model = GenerativeModel::new(0.0, [("a", 0.0)], 50.0, 0.0, 0.0).unwrap();
        let mut rng = replicate_rng(3, 0, 0);
        let data = simulate_responses(&design, &model, &mut rng).unwrap();
        for (row, rt) in data.iter() {
            let first = data
                .iter()
                .find(|(r, _)| r.participant == row.participant)
                .map(|(_, v)| v)
                .unwrap();
            assert_relative_eq!(rt, first);
        }
    }

    #[test]
    fn test_draw_covers_all_groups() {
        let design = generate_design(6, 4, &["a"]).unwrap();
        let draw = draw_random_effects(&design, &word_types(), &mut replicate_rng(5, 0, 0));
        assert_eq!(draw.participant.len(), 6);
        assert_eq!(draw.item.len(), 4);
        assert!(draw.participant.keys().copied().eq(1..=6));
    }

    #[test]
    fn test_unknown_level() {
        let design = generate_design(2, 2, &["Verb", "Pronoun"]).unwrap();
        let result = simulate_responses(&design, &word_types(), &mut replicate_rng(1, 0, 0));
        assert!(matches!(result, Err(PowerError::InvalidArgument(_))));
    }
}
