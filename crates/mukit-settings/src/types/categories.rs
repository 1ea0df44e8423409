//! Category rule table consumed by the classifier.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// How a rule's patterns are tested against a directive body.
/// All matching is case-insensitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Body starts with the pattern, followed by whitespace or end of text.
    #[default]
    Prefix,
    /// Pattern appears anywhere as a whole word.
    Word,
    /// Pattern appears anywhere as a substring.
    Contains,
}

/// One row of the rule table. Rules are evaluated in file order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRule {
    pub label: String,
    #[serde(rename = "match", default)]
    pub kind: MatchKind,
    pub patterns: Vec<String>,
}

impl CategoryRule {
    pub fn new(label: &str, kind: MatchKind, patterns: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            kind,
            patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

/// Category taxonomy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategorySettings {
    /// Label for bodies no rule matches.
    pub fallback: String,
    pub rules: Vec<CategoryRule>,
}

impl Default for CategorySettings {
    fn default() -> Self {
        Self {
            fallback: "misc".to_string(),
            rules: vec![
                CategoryRule::new(
                    "food",
                    MatchKind::Prefix,
                    &["breakfast", "lunch", "dinner", "snack", "coffee", "ate", "eat"],
                ),
                CategoryRule::new(
                    "fitness",
                    MatchKind::Prefix,
                    &["gym", "workout", "run", "yoga", "walk", "swim", "training"],
                ),
                CategoryRule::new("sleep", MatchKind::Prefix, &["sleep", "nap", "woke", "bed"]),
                CategoryRule::new("work", MatchKind::Prefix, &["work", "meeting", "standup", "call"]),
                CategoryRule::new(
                    "health",
                    MatchKind::Word,
                    &["pill", "medication", "vitamin", "doctor"],
                ),
                CategoryRule::new("mood", MatchKind::Prefix, &["mood", "feeling", "felt"]),
            ],
        }
    }
}

impl CategorySettings {
    pub fn validate(&self) -> Result<()> {
        if self.fallback.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "categories.fallback must not be empty".into(),
            ));
        }
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.label.trim().is_empty() {
                return Err(SettingsError::InvalidValue(format!(
                    "categories.rules[{idx}] has an empty label"
                )));
            }
            if rule.patterns.is_empty() || rule.patterns.iter().any(|p| p.trim().is_empty()) {
                return Err(SettingsError::InvalidValue(format!(
                    "categories.rules[{idx}] ({}) needs non-empty patterns",
                    rule.label
                )));
            }
        }
        Ok(())
    }
}
