//! Formula parsing for the fixed part of a model.

use crate::error::{PowerError, Result};
use serde::{Deserialize, Serialize};

/// A term in a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Intercept term (constant).
    Intercept,
    /// Main effect of a variable.
    Main(String),
    /// Interaction between two variables.
    Interaction(String, String),
}

impl Term {
    /// Get the variable names involved in this term.
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Term::Intercept => vec![],
            Term::Main(v) => vec![v.as_str()],
            Term::Interaction(v1, v2) => vec![v1.as_str(), v2.as_str()],
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Intercept => write!(f, "1"),
            Term::Main(v) => write!(f, "{}", v),
            Term::Interaction(v1, v2) => write!(f, "{}:{}", v1, v2),
        }
    }
}

/// A parsed formula specifying the fixed effects of a model.
///
/// Supports R-style formula syntax with an optional response:
/// - `RT ~ type` - intercept + type
/// - `~ type + item` - intercept + type + item
/// - `~ type * item` - intercept + type + item + type:item
/// - `~ 0 + type` - no intercept, type
/// - `~ 1` - intercept only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    /// Response variable, if given on the left-hand side.
    pub response: Option<String>,
    /// Whether to include an intercept.
    pub intercept: bool,
    /// Terms in the formula (excluding intercept).
    pub terms: Vec<Term>,
    /// Original formula string.
    pub formula_str: String,
}

/// Split `lhs ~ rhs`, returning the optional response and the trimmed rhs.
pub(crate) fn split_response(formula: &str) -> Result<(Option<String>, &str)> {
    let (lhs, rhs) = formula.split_once('~').ok_or_else(|| {
        PowerError::FormulaParse("Formula must contain '~'".to_string())
    })?;

    let lhs = lhs.trim();
    let response = if lhs.is_empty() {
        None
    } else if lhs.contains(|c: char| c.is_whitespace() || "+()|*:".contains(c)) {
        return Err(PowerError::FormulaParse(format!(
            "Response must be a single variable, got '{}'",
            lhs
        )));
    } else {
        Some(lhs.to_string())
    };

    let rhs = rhs.trim();
    if rhs.is_empty() {
        return Err(PowerError::FormulaParse(
            "Formula right-hand side is empty".to_string(),
        ));
    }

    Ok((response, rhs))
}

impl Formula {
    /// Parse a formula string.
    ///
    /// # Examples
    /// ```
    /// use composable_power::data::Formula;
    /// let f = Formula::parse("RT ~ type").unwrap();
    /// assert!(f.intercept);
    /// assert_eq!(f.response.as_deref(), Some("RT"));
    /// assert_eq!(f.terms.len(), 1);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let formula_str = formula.to_string();
        let (response, rhs) = split_response(formula.trim())?;

        // Check for explicit no-intercept
        let (intercept, rhs) = if rhs == "0" || rhs == "-1" {
            return Err(PowerError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        } else if rhs.starts_with("0 +") || rhs.starts_with("0+") {
            (false, rhs.trim_start_matches('0').trim_start_matches(|c: char| c == '+' || c.is_whitespace()))
        } else if rhs.starts_with("-1 +") || rhs.starts_with("-1+") {
            (false, rhs.trim_start_matches("-1").trim_start_matches(|c: char| c == '+' || c.is_whitespace()))
        } else {
            (true, rhs)
        };

        let mut terms = Vec::new();
        for term_str in rhs.split('+').map(|s| s.trim()) {
            if term_str.is_empty() || term_str == "1" {
                continue;
            }

            if term_str.contains('*') {
                let (v1, v2) = split_pair(term_str, '*')?;
                let main1 = Term::Main(v1.clone());
                let main2 = Term::Main(v2.clone());
                if !terms.contains(&main1) {
                    terms.push(main1);
                }
                if !terms.contains(&main2) {
                    terms.push(main2);
                }
                terms.push(Term::Interaction(v1, v2));
            } else if term_str.contains(':') {
                let (v1, v2) = split_pair(term_str, ':')?;
                terms.push(Term::Interaction(v1, v2));
            } else {
                let main = Term::Main(term_str.to_string());
                if !terms.contains(&main) {
                    terms.push(main);
                }
            }
        }

        if terms.is_empty() && !intercept {
            return Err(PowerError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        }

        Ok(Self {
            response,
            intercept,
            terms,
            formula_str,
        })
    }

    /// Get all variable names used on the right-hand side.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self.terms.iter().flat_map(|t| t.variables()).collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Check if a variable is used in the formula.
    pub fn uses_variable(&self, name: &str) -> bool {
        self.terms.iter().any(|t| t.variables().contains(&name))
    }
}

fn split_pair(term_str: &str, sep: char) -> Result<(String, String)> {
    let parts: Vec<&str> = term_str.split(sep).map(|s| s.trim()).collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(PowerError::FormulaParse(format!(
            "Invalid interaction term: {}",
            term_str
        )));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(response) = &self.response {
            write!(f, "{} ", response)?;
        }
        write!(f, "~ ")?;
        if !self.intercept {
            write!(f, "0 + ")?;
        }
        if self.terms.is_empty() {
            return write!(f, "1");
        }
        let term_strs: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", term_strs.join(" + "))
    }
}
