//! The assumed data-generating model.

use crate::error::{PowerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fixed offset for one level of the `type` factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedEffect {
    /// Level label.
    pub level: String,
    /// Additive offset from the grand mean.
    pub offset: f64,
}

/// Parameters of the generative model:
/// `RT = grand_mean + effect[type] + u_participant + w_item + e`
/// with `u ~ N(0, sd_participant²)`, `w ~ N(0, sd_item²)`, `e ~ N(0, sd_residual²)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerativeModel {
    /// Grand mean of the response.
    pub grand_mean: f64,
    /// Per-level fixed offsets, in level order.
    pub fixed_effects: Vec<FixedEffect>,
    /// Standard deviation of the participant random intercept.
    pub sd_participant: f64,
    /// Standard deviation of the item random intercept.
    pub sd_item: f64,
    /// Standard deviation of the residual noise.
    pub sd_residual: f64,
}

impl GenerativeModel {
    /// Create and validate a model.
    pub fn new<S: Into<String>>(
        grand_mean: f64,
        fixed_effects: impl IntoIterator<Item = (S, f64)>,
        sd_participant: f64,
        sd_item: f64,
        sd_residual: f64,
    ) -> Result<Self> {
        let model = Self {
            grand_mean,
            fixed_effects: fixed_effects
                .into_iter()
                .map(|(level, offset)| FixedEffect {
                    level: level.into(),
                    offset,
                })
                .collect(),
            sd_participant,
            sd_item,
            sd_residual,
        };
        model.validate()?;
        Ok(model)
    }

    /// Check parameter invariants. Models built through [`GenerativeModel::new`]
    /// are already validated; call this after deserializing.
    pub fn validate(&self) -> Result<()> {
        if !self.grand_mean.is_finite() {
            return Err(PowerError::InvalidArgument(
                "Grand mean must be finite".to_string(),
            ));
        }
        if self.fixed_effects.is_empty() {
            return Err(PowerError::InvalidArgument(
                "At least one fixed effect level is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for effect in &self.fixed_effects {
            if effect.level.trim().is_empty() {
                return Err(PowerError::InvalidArgument(
                    "Fixed effect level labels cannot be empty".to_string(),
                ));
            }
            if !seen.insert(effect.level.as_str()) {
                return Err(PowerError::InvalidArgument(format!(
                    "Duplicate fixed effect level '{}'",
                    effect.level
                )));
            }
            if !effect.offset.is_finite() {
                return Err(PowerError::InvalidArgument(format!(
                    "Fixed effect for level '{}' must be finite",
                    effect.level
                )));
            }
        }
        for (name, sd) in [
            ("sd_participant", self.sd_participant),
            ("sd_item", self.sd_item),
            ("sd_residual", self.sd_residual),
        ] {
            if !sd.is_finite() || sd < 0.0 {
                return Err(PowerError::InvalidArgument(format!(
                    "{} must be finite and non-negative, got {}",
                    name, sd
                )));
            }
        }
        Ok(())
    }

    /// Level labels in model order.
    pub fn levels(&self) -> Vec<&str> {
        self.fixed_effects.iter().map(|e| e.level.as_str()).collect()
    }

    /// Offset for a level, if the level exists.
    pub fn offset(&self, level: &str) -> Option<f64> {
        self.fixed_effects
            .iter()
            .find(|e| e.level == level)
            .map(|e| e.offset)
    }

    /// Same model with every fixed offset set to zero (the null hypothesis).
    pub fn without_fixed_effects(&self) -> Self {
        Self {
            fixed_effects: self
                .fixed_effects
                .iter()
                .map(|e| FixedEffect {
                    level: e.level.clone(),
                    offset: 0.0,
                })
                .collect(),
            ..self.clone()
        }
    }

    /// Same model with every fixed offset multiplied by `factor`.
    pub fn with_scaled_effects(&self, factor: f64) -> Self {
        Self {
            fixed_effects: self
                .fixed_effects
                .iter()
                .map(|e| FixedEffect {
                    level: e.level.clone(),
                    offset: e.offset * factor,
                })
                .collect(),
            ..self.clone()
        }
    }

    /// Whether all fixed offsets are equal, i.e. the tested null hypothesis is true.
    pub fn is_null(&self) -> bool {
        self.fixed_effects.first().map_or(true, |first| {
            self.fixed_effects.iter().all(|e| e.offset == first.offset)
        })
    }

    /// Total variance of a single observation.
    pub fn total_variance(&self) -> f64 {
        self.sd_participant.powi(2) + self.sd_item.powi(2) + self.sd_residual.powi(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn test_accessors() {
        let model = word_types();
        assert_eq!(model.levels(), vec!["Verb", "Noun", "Adj", "Adv"]);
        assert_eq!(model.offset("Noun"), Some(30.0));
        assert_eq!(model.offset("Pronoun"), None);
        assert_relative_eq!(model.total_variance(), 10000.0 + 6400.0 + 40000.0);
        assert!(!model.is_null());
    }

    #[test]
    fn test_null_and_scaled() {
        let model = word_types();
        assert!(model.without_fixed_effects().is_null());
        let doubled = model.with_scaled_effects(2.0);
        assert_eq!(doubled.offset("Verb"), Some(-40.0));
        assert_eq!(doubled.sd_item, model.sd_item);
    }

    #[test]
    fn test_empty_levels_is_null_but_invalid() {
        let model = GenerativeModel {
            fixed_effects: Vec::new(),
            ..word_types()
        };
        assert!(model.is_null());
        assert!(matches!(model.validate(), Err(PowerError::InvalidArgument(_))));
    }

    #[test]
    fn test_negative_sd_rejected() {
        let result = GenerativeModel::new(0.0, [("a", 0.0)], -1.0, 0.0, 1.0);
        assert!(matches!(result, Err(PowerError::InvalidArgument(_))));
        assert!(GenerativeModel::new(0.0, [("a", 0.0)], 0.0, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_level_validation() {
        let empty: [(&str, f64); 0] = [];
        assert!(GenerativeModel::new(0.0, empty, 1.0, 1.0, 1.0).is_err());
        assert!(GenerativeModel::new(0.0, [("a", 1.0), ("a", 2.0)], 1.0, 1.0, 1.0).is_err());
        assert!(GenerativeModel::new(f64::INFINITY, [("a", 1.0)], 1.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_yaml_round_trip_validates() {
        let yaml = serde_yaml::to_string(&word_types()).unwrap();
        let loaded: GenerativeModel = serde_yaml::from_str(&yaml).unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded, word_types());
    }
}
