//! Fixed-effects design matrix construction from a dataset and formula.

use crate::data::{Factor, Formula, SimulatedDataset, Term};
use crate::error::{PowerError, Result};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// Columns of the design matrix belonging to one formula term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermColumns {
    /// Term label (e.g. "type", "type:item").
    pub term: String,
    /// Column indices in the design matrix.
    pub columns: Vec<usize>,
}

/// A fixed-effects design matrix (X) with treatment-coded factors.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    /// The design matrix (observations × coefficients).
    matrix: DMatrix<f64>,
    /// Names of the coefficients (columns).
    coefficient_names: Vec<String>,
    /// Column ranges per term, in formula order.
    term_columns: Vec<TermColumns>,
    /// Reference levels for categorical variables.
    reference_levels: HashMap<String, String>,
}

impl DesignMatrix {
    /// Build a design matrix from a dataset and formula.
    ///
    /// Every variable is treated as categorical. With an intercept the first level of
    /// each factor is the reference and is dropped; without one, the first main-effect
    /// factor keeps all its levels.
    pub fn from_formula(dataset: &SimulatedDataset, formula: &Formula) -> Result<Self> {
        let n_samples = dataset.n_rows();

        for var in formula.variables() {
            if !dataset.has_column(var) {
                return Err(PowerError::MissingColumn(var.to_string()));
            }
        }

        let mut factors: HashMap<String, Factor> = HashMap::new();
        let mut reference_levels = HashMap::new();
        for var in formula.variables() {
            let factor = dataset.factor(var)?;
            if let Some(first) = factor.levels.first() {
                reference_levels.insert(var.to_string(), first.clone());
            }
            factors.insert(var.to_string(), factor);
        }

        let mut coefficient_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut term_columns = Vec::new();

        if formula.intercept {
            coefficient_names.push("(Intercept)".to_string());
            columns.push(vec![1.0; n_samples]);
        }

        // Without an intercept the first main effect absorbs it with full dummy coding.
        let mut full_rank_pending = !formula.intercept;

        for term in &formula.terms {
            let start = columns.len();
            match term {
                Term::Intercept => continue,
                Term::Main(var_name) => {
                    let factor = &factors[var_name];
                    let keep_reference = full_rank_pending;
                    full_rank_pending = false;
                    for (name, col) in Self::factor_columns(var_name, factor, keep_reference) {
                        coefficient_names.push(name);
                        columns.push(col);
                    }
                }
                Term::Interaction(var1, var2) => {
                    let cols1 = Self::factor_columns(var1, &factors[var1], false);
                    let cols2 = Self::factor_columns(var2, &factors[var2], false);

                    for (name1, col1) in &cols1 {
                        for (name2, col2) in &cols2 {
                            coefficient_names.push(format!("{}:{}", name1, name2));
                            columns.push(col1.iter().zip(col2.iter()).map(|(a, b)| a * b).collect());
                        }
                    }
                }
            }
            term_columns.push(TermColumns {
                term: term.to_string(),
                columns: (start..columns.len()).collect(),
            });
        }

        let n_coef = columns.len();
        let mut matrix = DMatrix::zeros(n_samples, n_coef);
        for (col_idx, col) in columns.iter().enumerate() {
            for (row_idx, &val) in col.iter().enumerate() {
                matrix[(row_idx, col_idx)] = val;
            }
        }

        Ok(Self {
            matrix,
            coefficient_names,
            term_columns,
            reference_levels,
        })
    }

    /// Indicator columns for a factor, optionally keeping the reference level.
    fn factor_columns(
        var_name: &str,
        factor: &Factor,
        keep_reference: bool,
    ) -> Vec<(String, Vec<f64>)> {
        let skip = if keep_reference { 0 } else { 1 };
        factor
            .levels
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(level_idx, level)| {
                let col = factor
                    .codes
                    .iter()
                    .map(|&c| if c == level_idx { 1.0 } else { 0.0 })
                    .collect();
                (format!("{}{}", var_name, level), col)
            })
            .collect()
    }

    /// Get the design matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Get coefficient names.
    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Column groups per formula term.
    pub fn term_columns(&self) -> &[TermColumns] {
        &self.term_columns
    }

    /// Number of observations (rows).
    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coefficients (columns).
    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Get the reference level for a categorical variable.
    pub fn reference_level(&self, variable: &str) -> Option<&str> {
        self.reference_levels.get(variable).map(|s| s.as_str())
    }

    /// Get the index of a coefficient by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Check if the matrix has an intercept.
    pub fn has_intercept(&self) -> bool {
        self.coefficient_names.first().map(String::as_str) == Some("(Intercept)")
    }
}
