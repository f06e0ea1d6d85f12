//! Balanced factorial designs crossing a fixed factor with participants and items.

use crate::error::{PowerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One observation's position in the design.
///
/// `level` indexes into [`Design::levels`]; participant and item ids are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DesignRow {
    /// Index of the `type` level.
    pub level: usize,
    /// Participant id (1..=n_participants).
    pub participant: usize,
    /// Item id (1..=n_items).
    pub item: usize,
}

/// A design table: ordered level labels plus one row per observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Design {
    levels: Vec<String>,
    rows: Vec<DesignRow>,
}

impl Design {
    /// Build a design from explicit rows.
    ///
    /// Every row must reference an existing level and carry positive ids.
    pub fn from_rows(levels: Vec<String>, rows: Vec<DesignRow>) -> Result<Self> {
        validate_levels(&levels)?;
        for (i, row) in rows.iter().enumerate() {
            if row.level >= levels.len() {
                return Err(PowerError::InvalidArgument(format!(
                    "Row {} references level index {} but only {} levels exist",
                    i,
                    row.level,
                    levels.len()
                )));
            }
            if row.participant == 0 || row.item == 0 {
                return Err(PowerError::InvalidArgument(format!(
                    "Row {} has a zero participant or item id",
                    i
                )));
            }
        }
        Ok(Self { levels, rows })
    }

    /// Ordered level labels of the `type` factor.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Design rows in generation order.
    pub fn rows(&self) -> &[DesignRow] {
        &self.rows
    }

    /// Label of a row's level.
    pub fn level_label(&self, row: &DesignRow) -> &str {
        &self.levels[row.level]
    }

    /// Number of observations.
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of `type` levels.
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Distinct participant ids, ascending.
    pub fn participant_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.rows.iter().map(|r| r.participant).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Distinct item ids, ascending.
    pub fn item_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.rows.iter().map(|r| r.item).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Check if the design is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn validate_levels(levels: &[String]) -> Result<()> {
    if levels.is_empty() {
        return Err(PowerError::InvalidArgument(
            "At least one level is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for level in levels {
        if level.trim().is_empty() {
            return Err(PowerError::InvalidArgument(
                "Level labels cannot be empty".to_string(),
            ));
        }
        if !seen.insert(level.as_str()) {
            return Err(PowerError::InvalidArgument(format!(
                "Duplicate level label '{}'",
                level
            )));
        }
    }
    Ok(())
}

/// Generate the full factorial crossing of `levels` × participants × items.
///
/// Rows are level-major, then participant, then item. The result has exactly
/// `n_participants * n_items * levels.len()` rows, one per unique triple.
///
/// # Errors
/// `InvalidArgument` if either count is zero, `levels` is empty, or a label repeats.
pub fn generate_design<S: AsRef<str>>(
    n_participants: usize,
    n_items: usize,
    levels: &[S],
) -> Result<Design> {
    if n_participants == 0 {
        return Err(PowerError::InvalidArgument(
            "Participant count must be a positive integer".to_string(),
        ));
    }
    if n_items == 0 {
        return Err(PowerError::InvalidArgument(
            "Item count must be a positive integer".to_string(),
        ));
    }

    let levels: Vec<String> = levels.iter().map(|l| l.as_ref().to_string()).collect();
    validate_levels(&levels)?;

    let mut rows = Vec::with_capacity(levels.len() * n_participants * n_items);
    for level in 0..levels.len() {
        for participant in 1..=n_participants {
            for item in 1..=n_items {
                rows.push(DesignRow {
                    level,
                    participant,
                    item,
                });
            }
        }
    }

    Ok(Design { levels, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_TYPES: [&str; 4] = ["Verb", "Noun", "Adj", "Adv"];

    #[test]
    fn test_row_count() {
        for (n, m) in [(1, 1), (3, 5), (10, 10), (7, 2)] {
            let design = generate_design(n, m, &WORD_TYPES).unwrap();
            assert_eq!(design.n_rows(), n * m * WORD_TYPES.len());
        }
    }

    #[test]
    fn test_triples_unique() {
        let design = generate_design(6, 4, &WORD_TYPES).unwrap();
        let unique: HashSet<DesignRow> = design.rows().iter().copied().collect();
        assert_eq!(unique.len(), design.n_rows());
    }

    #[test]
    fn test_level_major_order() {
        let design = generate_design(2, 3, &["a", "b"]).unwrap();
        let first = design.rows()[0];
        assert_eq!((first.level, first.participant, first.item), (0, 1, 1));
        let seventh = design.rows()[6];
        assert_eq!((seventh.level, seventh.participant, seventh.item), (1, 1, 1));
        assert_eq!(design.level_label(&seventh), "b");
    }

    #[test]
    fn test_ids() {
        let design = generate_design(3, 2, &WORD_TYPES).unwrap();
        assert_eq!(design.participant_ids(), vec![1, 2, 3]);
        assert_eq!(design.item_ids(), vec![1, 2]);
    }

    #[test]
    fn test_invalid_counts() {
        assert!(matches!(
            generate_design(0, 5, &WORD_TYPES),
            Err(PowerError::InvalidArgument(_))
        ));
        assert!(matches!(
            generate_design(5, 0, &WORD_TYPES),
            Err(PowerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_levels() {
        let empty: [&str; 0] = [];
        assert!(generate_design(2, 2, &empty).is_err());
        assert!(generate_design(2, 2, &["a", "a"]).is_err());
        assert!(generate_design(2, 2, &["a", " "]).is_err());
    }

    #[test]
    fn test_from_rows_validation() {
        let levels = vec!["a".to_string()];
        let bad_level = vec![DesignRow { level: 1, participant: 1, item: 1 }];
        assert!(Design::from_rows(levels.clone(), bad_level).is_err());
        let bad_id = vec![DesignRow { level: 0, participant: 0, item: 1 }];
        assert!(Design::from_rows(levels.clone(), bad_id).is_err());
        let ok = vec![DesignRow { level: 0, participant: 2, item: 3 }];
        assert_eq!(Design::from_rows(levels, ok).unwrap().n_rows(), 1);
    }
}
