//! Read-only market-data gateway port.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::error::DataError;
use crate::domain::models::frame::Frame;

/// Category of a manifest field. Categories drive the validator's
/// hard/soft rules and the ordering inside LLM prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    /// Split/dividend-adjusted price series; preferred for backtesting.
    AdjustedPrice,
    /// Raw unadjusted price series; forbidden for backtesting.
    RawPrice,
    Fundamental,
    TechnicalIndicator,
    Liquidity,
}

impl FieldCategory {
    pub const fn is_forbidden(self) -> bool {
        matches!(self, Self::RawPrice)
    }
}

/// The fixed set of permitted symbolic keys, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldManifest {
    /// Key to category, e.g. `close_adj -> adjusted_price`.
    pub fields: BTreeMap<String, FieldCategory>,
}

impl FieldManifest {
    pub fn category(&self, key: &str) -> Option<FieldCategory> {
        self.fields.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Keys of one category, sorted.
    pub fn keys_in(&self, category: FieldCategory) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, c)| **c == category)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Closest permitted, non-forbidden key by edit distance; used for
    /// `unknown_field` suggestions.
    pub fn suggest(&self, key: &str) -> Option<String> {
        self.fields
            .iter()
            .filter(|(_, c)| !c.is_forbidden())
            .map(|(k, _)| (k, edit_distance(key, k)))
            .filter(|(_, d)| *d <= 3)
            .min_by_key(|(_, d)| *d)
            .map(|(k, _)| k.clone())
    }
}

/// Outcome of a field validation query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValidation {
    Ok,
    SuggestAlternative(String),
}

/// Pure read interface: symbolic key to a (date × symbol) matrix.
///
/// Shared safely across the engine and every sandbox worker; no
/// mutation after startup.
pub trait DataAccessor: Send + Sync {
    /// Fetch the matrix for a permitted key.
    fn get(&self, key: &str) -> Result<Frame, DataError>;

    /// Whether a key is permitted, with a corrective suggestion when
    /// not.
    fn validate_field(&self, key: &str) -> Result<FieldValidation, DataError>;

    /// The manifest fixed at startup.
    fn manifest(&self) -> &FieldManifest;
}

/// Shared handle used throughout the engine.
pub type SharedDataAccessor = Arc<dyn DataAccessor>;

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
