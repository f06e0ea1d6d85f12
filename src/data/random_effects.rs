//! Random effects specification for mixed models.
//!
//! Supports lme4-style syntax for specifying random effects:
//! - `(1 | participant)` - random intercept per participant
//! - `(1 + type | participant)` - random intercept and slope (parsed, not fitted)
//! - `(0 + type | participant)` - random slope only (parsed, not fitted)

use crate::data::formula::split_response;
use crate::data::{Formula, SimulatedDataset, Term};
use crate::error::{PowerError, Result};
use nalgebra::DMatrix;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A single random effect term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomEffect {
    /// Terms in the random effect (e.g., ["1"] for intercept, ["1", "type"] for intercept + slope).
    pub terms: Vec<String>,
    /// Grouping variable (e.g., "participant").
    pub grouping: String,
    /// Whether to include a random intercept.
    pub has_intercept: bool,
}

impl RandomEffect {
    /// Parse a random effect specification string.
    ///
    /// - `(1 | participant)` -> intercept only
    /// - `(1 + type | participant)` -> intercept + slope
    /// - `(0 + type | participant)` -> slope only
    /// - `(type | participant)` -> intercept + slope (implicit intercept)
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();

        if !spec.starts_with('(') || !spec.ends_with(')') {
            return Err(PowerError::FormulaParse(format!(
                "Random effect must be wrapped in parentheses: {}",
                spec
            )));
        }

        let inner = spec[1..spec.len() - 1].trim();

        let parts: Vec<&str> = inner.split('|').collect();
        if parts.len() != 2 {
            return Err(PowerError::FormulaParse(format!(
                "Random effect must have exactly one '|': {}",
                spec
            )));
        }

        let terms_str = parts[0].trim();
        let grouping = parts[1].trim().to_string();

        if grouping.is_empty() {
            return Err(PowerError::FormulaParse(
                "Random effect grouping variable cannot be empty".to_string(),
            ));
        }

        let mut terms = Vec::new();
        let mut has_intercept = true;

        for term in terms_str.split('+') {
            let term = term.trim();
            match term {
                "" | "1" => {}
                "0" | "-1" => has_intercept = false,
                _ => terms.push(term.to_string()),
            }
        }

        if has_intercept {
            terms.insert(0, "1".to_string());
        }

        if terms.is_empty() {
            return Err(PowerError::FormulaParse(
                "Random effect must have at least one term".to_string(),
            ));
        }

        Ok(Self {
            terms,
            grouping,
            has_intercept,
        })
    }

    /// Check if this is a random intercept only.
    pub fn is_intercept_only(&self) -> bool {
        self.terms.len() == 1 && self.terms[0] == "1"
    }

    /// Number of random effect terms per group.
    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }
}

impl std::fmt::Display for RandomEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms = if self.has_intercept {
            self.terms.join(" + ")
        } else {
            format!("0 + {}", self.terms.join(" + "))
        };
        write!(f, "({} | {})", terms, self.grouping)
    }
}

fn random_effect_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\([^()]+\|[^()]+\)").expect("random effect pattern is valid")
    })
}

/// A formula with both fixed and random effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedFormula {
    /// Fixed effects formula (carries the response, if any).
    pub fixed: Formula,
    /// Random effects.
    pub random: Vec<RandomEffect>,
    /// Original formula string.
    pub formula_str: String,
}

impl MixedFormula {
    /// Parse a mixed model formula.
    ///
    /// - `RT ~ type + (1 | participant) + (1 | item)`
    /// - `~ type + (1 | participant)`
    ///
    /// # Examples
    /// ```
    /// use composable_power::data::MixedFormula;
    /// let f = MixedFormula::parse("RT ~ type + (1 | participant) + (1 | item)").unwrap();
    /// assert!(f.fixed.intercept);
    /// assert_eq!(f.random.len(), 2);
    /// assert!(f.random.iter().all(|r| r.is_intercept_only()));
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let formula_str = formula.to_string();
        let (response, rhs) = split_response(formula.trim())?;

        let pattern = random_effect_pattern();
        let random_strs: Vec<&str> = pattern.find_iter(rhs).map(|m| m.as_str()).collect();

        let random: Vec<RandomEffect> = random_strs
            .iter()
            .map(|s| RandomEffect::parse(s))
            .collect::<Result<Vec<_>>>()?;

        let mut fixed_str = rhs.to_string();
        for re_str in &random_strs {
            fixed_str = fixed_str.replace(re_str, "");
        }

        if fixed_str.contains('|') || fixed_str.contains('(') || fixed_str.contains(')') {
            return Err(PowerError::FormulaParse(format!(
                "Malformed random effect in formula: {}",
                formula_str
            )));
        }

        let fixed_str = fixed_str
            .split('+')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" + ");

        let fixed_rhs = if fixed_str.is_empty() {
            "1".to_string()
        } else {
            fixed_str
        };
        let fixed_formula_str = match &response {
            Some(r) => format!("{} ~ {}", r, fixed_rhs),
            None => format!("~ {}", fixed_rhs),
        };

        let fixed = Formula::parse(&fixed_formula_str)?;

        Ok(Self {
            fixed,
            random,
            formula_str,
        })
    }

    /// The standard crossed design formula: `RT ~ type + (1 | participant) + (1 | item)`.
    pub fn crossed_intercepts() -> Self {
        Self {
            fixed: Formula {
                response: Some("RT".to_string()),
                intercept: true,
                terms: vec![Term::Main("type".to_string())],
                formula_str: "RT ~ type".to_string(),
            },
            random: vec![
                RandomEffect {
                    terms: vec!["1".to_string()],
                    grouping: "participant".to_string(),
                    has_intercept: true,
                },
                RandomEffect {
                    terms: vec!["1".to_string()],
                    grouping: "item".to_string(),
                    has_intercept: true,
                },
            ],
            formula_str: "RT ~ type + (1 | participant) + (1 | item)".to_string(),
        }
    }

    /// Response variable name, if given.
    pub fn response(&self) -> Option<&str> {
        self.fixed.response.as_deref()
    }

    /// Check if the formula has any random effects.
    pub fn has_random_effects(&self) -> bool {
        !self.random.is_empty()
    }

    /// Get all grouping variables.
    pub fn grouping_variables(&self) -> Vec<&str> {
        self.random.iter().map(|r| r.grouping.as_str()).collect()
    }

    /// Total number of random effects (sum of terms across all random effect specifications).
    pub fn total_random_effects(&self) -> usize {
        self.random.iter().map(|r| r.n_terms()).sum()
    }
}

impl std::fmt::Display for MixedFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.formula_str)
    }
}

/// Design matrix for one random-intercept grouping factor (a block of Z).
#[derive(Debug, Clone)]
pub struct RandomDesignMatrix {
    /// Grouping variable name.
    pub grouping: String,
    /// The Z block (observations × groups).
    pub matrix: DMatrix<f64>,
    /// Group index for each observation.
    pub group_indices: Vec<usize>,
    /// Group labels in coding order.
    pub group_ids: Vec<String>,
    /// Number of groups.
    pub n_groups: usize,
}

impl RandomDesignMatrix {
    /// Build the random intercept design block for `random_effect` from a dataset.
    ///
    /// Only random intercepts `(1 | group)` are supported.
    pub fn from_random_effect(
        dataset: &SimulatedDataset,
        random_effect: &RandomEffect,
    ) -> Result<Self> {
        if !random_effect.is_intercept_only() {
            return Err(PowerError::InvalidArgument(format!(
                "Random slopes are not supported: {}. Use (1 | {}) for a random intercept.",
                random_effect, random_effect.grouping
            )));
        }

        let factor = dataset.factor(&random_effect.grouping)?;
        let n_samples = factor.codes.len();
        let n_groups = factor.n_levels();

        let mut z = DMatrix::zeros(n_samples, n_groups);
        for (sample_idx, &group_idx) in factor.codes.iter().enumerate() {
            z[(sample_idx, group_idx)] = 1.0;
        }

        Ok(Self {
            grouping: random_effect.grouping.clone(),
            matrix: z,
            group_indices: factor.codes,
            group_ids: factor.levels,
            n_groups,
        })
    }

    /// Number of observations.
    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    /// Get the Z block.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Number of observations per group.
    pub fn observations_per_group(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_groups];
        for &idx in &self.group_indices {
            counts[idx] += 1;
        }
        counts
    }
}
