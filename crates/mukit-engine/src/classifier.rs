//! Rule-table category classification.
//!
//! Rules come from settings and are evaluated in order; the first rule with a
//! matching pattern names the category. Bodies that match nothing get the
//! fallback label, so classification never fails.

use mukit_settings::{CategoryRule, CategorySettings, MatchKind};
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("fallback label must not be empty")]
    EmptyFallback,
    #[error("rule {index} has an empty label")]
    EmptyLabel { index: usize },
    #[error("rule {label} has no usable patterns")]
    EmptyPatterns { label: String },
    #[error("rule {label}: {source}")]
    Pattern {
        label: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
struct CompiledRule {
    label: String,
    kind: MatchKind,
    /// Lowercased, longest first.
    patterns: Vec<String>,
    /// Only for `MatchKind::Word`.
    word_regex: Option<Regex>,
}

impl CompiledRule {
    fn compile(index: usize, rule: &CategoryRule) -> Result<Self, ClassifierError> {
        let label = rule.label.trim();
        if label.is_empty() {
            return Err(ClassifierError::EmptyLabel { index });
        }

        let mut patterns: Vec<String> = rule
            .patterns
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Err(ClassifierError::EmptyPatterns {
                label: label.to_string(),
            });
        }
        patterns.sort_by(|a, b| b.len().cmp(&a.len()));

        let word_regex = match rule.kind {
            MatchKind::Word => {
                let alternation = patterns
                    .iter()
                    .map(|p| regex::escape(p))
                    .collect::<Vec<_>>()
                    .join("|");
                let re = Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).map_err(|source| {
                    ClassifierError::Pattern {
                        label: label.to_string(),
                        source,
                    }
                })?;
                Some(re)
            }
            MatchKind::Prefix | MatchKind::Contains => None,
        };

        Ok(Self {
            label: label.to_string(),
            kind: rule.kind,
            patterns,
            word_regex,
        })
    }

    fn matches(&self, lowered: &str) -> bool {
        match self.kind {
            MatchKind::Prefix => self.patterns.iter().any(|p| {
                lowered
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
            }),
            MatchKind::Word => self.word_regex.as_ref().is_some_and(|re| re.is_match(lowered)),
            MatchKind::Contains => self.patterns.iter().any(|p| lowered.contains(p.as_str())),
        }
    }
}

/// Maps directive bodies to category labels.
#[derive(Debug)]
pub struct CategoryClassifier {
    rules: Vec<CompiledRule>,
    fallback: String,
}

impl CategoryClassifier {
    pub fn new(rules: &[CategoryRule], fallback: &str) -> Result<Self, ClassifierError> {
        let fallback = fallback.trim();
        if fallback.is_empty() {
            return Err(ClassifierError::EmptyFallback);
        }
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule::compile(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            fallback: fallback.to_string(),
        })
    }

    pub fn from_settings(settings: &CategorySettings) -> Result<Self, ClassifierError> {
        Self::new(&settings.rules, &settings.fallback)
    }

    /// Total: unmatched bodies map to the fallback label.
    pub fn classify(&self, body: &str) -> &str {
        let lowered = body.trim().to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map_or(self.fallback.as_str(), |rule| rule.label.as_str())
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Labels in priority order, fallback excluded.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.label.as_str())
    }
}
