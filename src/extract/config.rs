//! Configuration for typed value extraction.

use std::collections::{HashMap, HashSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Forced interpretation of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeHint {
    #[default]
    Auto,
    String,
    Int,
    Double,
    Bool,
    Date,
    Timestamp,
    /// Column is excluded from extraction; every access yields NA.
    Skip,
}

/// Per-column overrides, keyed by index or (pre-resolution) by name.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ColumnConfig {
    pub type_hint: TypeHint,
    /// Column-specific NA spellings; `None` inherits the global set.
    pub na_values: Option<HashSet<String>>,
}

impl ColumnConfig {
    pub fn as_integer() -> Self {
        Self {
            type_hint: TypeHint::Int,
            ..Self::default()
        }
    }

    pub fn as_double() -> Self {
        Self {
            type_hint: TypeHint::Double,
            ..Self::default()
        }
    }

    pub fn as_string() -> Self {
        Self {
            type_hint: TypeHint::String,
            ..Self::default()
        }
    }

    pub fn skip() -> Self {
        Self {
            type_hint: TypeHint::Skip,
            ..Self::default()
        }
    }

    pub fn with_na_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.na_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Column overrides addressed by index or by header name. Name entries are
/// resolved to indexes once the header is known.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ColumnConfigMap {
    by_index: HashMap<usize, ColumnConfig>,
    by_name: HashMap<String, ColumnConfig>,
}

impl ColumnConfigMap {
    pub fn set(&mut self, column: usize, config: ColumnConfig) {
        self.by_index.insert(column, config);
    }

    pub fn set_named(&mut self, name: impl Into<String>, config: ColumnConfig) {
        self.by_name.insert(name.into(), config);
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty() && self.by_name.is_empty()
    }

    /// Flatten into a per-column table. Index entries win over name entries
    /// that resolve to the same column; names missing from the header are
    /// dropped.
    pub(crate) fn resolve(&self, header: &[String], num_columns: usize) -> Vec<Option<ColumnConfig>> {
        let mut resolved: Vec<Option<ColumnConfig>> = vec![None; num_columns];
        for (name, config) in &self.by_name {
            if let Some(col) = header.iter().position(|h| h == name) {
                if col < num_columns {
                    resolved[col] = Some(config.clone());
                }
            }
        }
        for (&col, config) in &self.by_index {
            if col < num_columns {
                resolved[col] = Some(config.clone());
            }
        }
        resolved
    }
}

/// Global settings for typed conversion.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtractionConfig {
    /// Spellings (after trimming) that decode as missing for every type.
    pub na_values: HashSet<String>,
    /// Case-insensitive spellings of boolean true.
    pub true_values: HashSet<String>,
    /// Case-insensitive spellings of boolean false.
    pub false_values: HashSet<String>,
    /// Trim ASCII space and tab from both ends before typed parsing.
    pub trim_whitespace: bool,
    /// When false, integers like `007` are rejected (`0` stays valid).
    pub allow_leading_zeros: bool,
    /// Hard cap on digits in an integer literal.
    pub max_integer_digits: u8,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            na_values: set(&["", "NA", "N/A", "null", "NULL"]),
            true_values: set(&["true", "t", "1", "yes"]),
            false_values: set(&["false", "f", "0", "no"]),
            trim_whitespace: true,
            allow_leading_zeros: true,
            max_integer_digits: 19,
        }
    }
}

impl ExtractionConfig {
    pub(crate) fn is_na(&self, text: &str) -> bool {
        self.na_values.contains(text)
    }
}
