use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A URL or a path on a named file system. Not validated before dispatch.
pub type ImageReference = String;

/// Categorical likelihood as reported by Google Cloud Vision SafeSearch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Likelihood {
    #[default]
    Unknown,
    VeryUnlikely,
    Unlikely,
    Possible,
    Likely,
    VeryLikely,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategoryValue {
    Likelihood(Likelihood),
    /// Whole-number score, kept distinct so it serializes as `0` not `0.0`.
    Integer(i64),
    Probability(f64),
}

impl From<Likelihood> for CategoryValue {
    fn from(value: Likelihood) -> Self {
        Self::Likelihood(value)
    }
}

impl From<i64> for CategoryValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for CategoryValue {
    fn from(value: f64) -> Self {
        Self::Probability(value)
    }
}

/// Per-image moderation result: provider category name to severity.
///
/// Records are values. Updating one yields a new record, so a default record
/// can be cloned into many slots without any slot observing another's changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ModerationRecord {
    categories: BTreeMap<String, CategoryValue>,
}

impl ModerationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, name: impl Into<String>, value: impl Into<CategoryValue>) -> Self {
        self.categories.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&CategoryValue> {
        self.categories.get(name)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.categories
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        CategoryValue::Likelihood(l) => {
                            serde_json::to_value(l).unwrap_or(serde_json::Value::Null)
                        }
                        CategoryValue::Integer(n) => serde_json::Value::from(*n),
                        CategoryValue::Probability(p) => serde_json::Value::from(*p),
                    };
                    (name.clone(), value)
                })
                .collect(),
        )
    }
}
