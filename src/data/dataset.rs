//! Simulated (or observed) datasets: a design table plus the `RT` response.

use crate::data::{Design, DesignRow};
use crate::error::{PowerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Column holding the fixed categorical factor.
pub const TYPE_COLUMN: &str = "type";
/// Column holding participant ids.
pub const PARTICIPANT_COLUMN: &str = "participant";
/// Column holding item ids.
pub const ITEM_COLUMN: &str = "item";
/// Column holding the continuous response.
pub const RESPONSE_COLUMN: &str = "RT";

/// A categorical column coded as integers.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    /// Level labels in coding order.
    pub levels: Vec<String>,
    /// Level index for each row.
    pub codes: Vec<usize>,
}

impl Factor {
    /// Number of levels.
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of rows per level.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.levels.len()];
        for &c in &self.codes {
            counts[c] += 1;
        }
        counts
    }

    /// Code integer ids, keeping them in ascending order.
    fn from_ids(ids: impl Iterator<Item = usize>) -> Self {
        let ids: Vec<usize> = ids.collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        let index: HashMap<usize, usize> =
            unique.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        Self {
            levels: unique.iter().map(|id| id.to_string()).collect(),
            codes: ids.iter().map(|id| index[id]).collect(),
        }
    }
}

/// A design table extended with one response value per row.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDataset {
    design: Design,
    rt: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetRecord {
    #[serde(rename = "type")]
    level: String,
    participant: usize,
    item: usize,
    #[serde(rename = "RT")]
    rt: f64,
}

impl SimulatedDataset {
    /// Attach a response column to a design.
    pub fn new(design: Design, rt: Vec<f64>) -> Result<Self> {
        if rt.len() != design.n_rows() {
            return Err(PowerError::DimensionMismatch {
                expected: design.n_rows(),
                actual: rt.len(),
            });
        }
        if let Some(i) = rt.iter().position(|v| !v.is_finite()) {
            return Err(PowerError::InvalidArgument(format!(
                "Response at row {} is not finite",
                i
            )));
        }
        Ok(Self { design, rt })
    }

    /// The underlying design.
    pub fn design(&self) -> &Design {
        &self.design
    }

    /// Response values in row order.
    pub fn rt(&self) -> &[f64] {
        &self.rt
    }

    /// Number of observations.
    pub fn n_rows(&self) -> usize {
        self.rt.len()
    }

    /// Iterate rows together with their response.
    pub fn iter(&self) -> impl Iterator<Item = (&DesignRow, f64)> + '_ {
        self.design.rows().iter().zip(self.rt.iter().copied())
    }

    /// Check whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        matches!(
            name,
            TYPE_COLUMN | PARTICIPANT_COLUMN | ITEM_COLUMN | RESPONSE_COLUMN
        )
    }

    /// Get a categorical column as a coded factor.
    ///
    /// `type` keeps the design's level order; participant and item ids are
    /// coded in ascending order.
    pub fn factor(&self, name: &str) -> Result<Factor> {
        let rows = self.design.rows();
        match name {
            TYPE_COLUMN => Ok(Factor {
                levels: self.design.levels().to_vec(),
                codes: rows.iter().map(|r| r.level).collect(),
            }),
            PARTICIPANT_COLUMN => Ok(Factor::from_ids(rows.iter().map(|r| r.participant))),
            ITEM_COLUMN => Ok(Factor::from_ids(rows.iter().map(|r| r.item))),
            RESPONSE_COLUMN => Err(PowerError::InvalidArgument(format!(
                "Column '{}' is continuous, not categorical",
                name
            ))),
            _ => Err(PowerError::MissingColumn(name.to_string())),
        }
    }

    /// Get the response column by name.
    pub fn response(&self, name: &str) -> Result<&[f64]> {
        if name == RESPONSE_COLUMN {
            Ok(&self.rt)
        } else if self.has_column(name) {
            Err(PowerError::InvalidArgument(format!(
                "Column '{}' is categorical and cannot be a response",
                name
            )))
        } else {
            Err(PowerError::MissingColumn(name.to_string()))
        }
    }

    /// Sample mean and variance (n - 1 denominator) of the response.
    pub fn response_moments(&self) -> (f64, f64) {
        let n = self.rt.len() as f64;
        let mean = self.rt.iter().sum::<f64>() / n;
        let var = if self.rt.len() > 1 {
            self.rt.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        (mean, var)
    }

    /// Write the dataset as a tab-separated file with columns type, participant, item, RT.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        for (row, rt) in self.iter() {
            writer.serialize(DatasetRecord {
                level: self.design.level_label(row).to_string(),
                participant: row.participant,
                item: row.item,
                rt,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a dataset written by [`SimulatedDataset::to_tsv`] (or a pilot dataset
    /// with the same columns). Levels are ordered by first appearance.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;

        let mut levels: Vec<String> = Vec::new();
        let mut level_index: HashMap<String, usize> = HashMap::new();
        let mut rows = Vec::new();
        let mut rt = Vec::new();

        for record in reader.deserialize() {
            let record: DatasetRecord = record?;
            let level = match level_index.get(&record.level) {
                Some(&idx) => idx,
                None => {
                    let idx = levels.len();
                    level_index.insert(record.level.clone(), idx);
                    levels.push(record.level);
                    idx
                }
            };
            rows.push(DesignRow {
                level,
                participant: record.participant,
                item: record.item,
            });
            rt.push(record.rt);
        }

        if rows.is_empty() {
            return Err(PowerError::InvalidArgument(
                "Dataset file contains no rows".to_string(),
            ));
        }

        let design = Design::from_rows(levels, rows)?;
        Self::new(design, rt)
    }
}
