//! Keyword classification for free-text vessel and incident types.
//!
//! Sources describe the same thing many ways ("LPG tanker", "Chemical/Oil
//! Products Tanker", "product tkr"). A [`KeywordRule`] table maps such text
//! onto one canonical label; rules are tried in order and the first rule
//! with a matching keyword wins, so more specific rules must come first.

use serde::{Deserialize, Serialize};

/// One canonical label and the keywords that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Canonical label emitted on match.
    pub canonical: String,
    /// Case-insensitive substrings; any one matching selects the rule.
    pub keywords: Vec<String>,
}

impl KeywordRule {
    /// Returns `true` if `lower` (already lowercased) contains any keyword.
    #[must_use]
    pub fn matches(&self, lower: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| lower.contains(&keyword.to_lowercase()))
    }
}

/// Returns the canonical label of the first matching rule.
///
/// Text that already equals a canonical label (case-insensitive) maps to
/// it, so classification is idempotent.
#[must_use]
pub fn classify<'a>(raw: &str, rules: &'a [KeywordRule]) -> Option<&'a str> {
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    rules
        .iter()
        .find(|rule| rule.canonical.to_lowercase() == lower)
        .or_else(|| rules.iter().find(|rule| rule.matches(&lower)))
        .map(|rule| rule.canonical.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<KeywordRule> {
        vec![
            KeywordRule {
                canonical: "Tanker".to_string(),
                keywords: vec!["tanker".to_string(), "LPG".to_string()],
            },
            KeywordRule {
                canonical: "General Cargo".to_string(),
                keywords: vec!["cargo".to_string()],
            },
        ]
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = rules();
        assert_eq!(classify("Chemical Tanker", &rules), Some("Tanker"));
        assert_eq!(classify("lpg carrier", &rules), Some("Tanker"));
        assert_eq!(classify("Cargo tanker", &rules), Some("Tanker"));
        assert_eq!(classify("multi-purpose cargo", &rules), Some("General Cargo"));
    }

    #[test]
    fn canonical_labels_are_stable() {
        let rules = rules();
        assert_eq!(classify("general cargo", &rules), Some("General Cargo"));
        assert_eq!(classify("Tanker", &rules), Some("Tanker"));
    }

    #[test]
    fn unknown_or_empty_text_is_unclassified() {
        let rules = rules();
        assert_eq!(classify("Yacht", &rules), None);
        assert_eq!(classify("  ", &rules), None);
    }
}
