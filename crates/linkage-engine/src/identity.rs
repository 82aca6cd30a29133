use std::fmt;

use serde::Serialize;

use crate::error::LinkageError;

/// Account identifier with formatting stripped.
///
/// `123-456-7890`, `123 456 7890` and `1234567890` all canonicalize to `1234567890`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalAccountId(String);

impl CanonicalAccountId {
    pub fn parse(raw: &str) -> Result<Self, LinkageError> {
        let canonical: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if canonical.is_empty() {
            return Err(LinkageError::InvalidAccountId(raw.to_string()));
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_variants_share_one_key() {
        let dashed = CanonicalAccountId::parse("123-456-7890").unwrap();
        let spaced = CanonicalAccountId::parse(" 123 456 7890 ").unwrap();
        let plain = CanonicalAccountId::parse("1234567890").unwrap();
        assert_eq!(dashed, plain);
        assert_eq!(spaced, plain);
        assert_eq!(plain.as_str(), "1234567890");
    }

    #[test]
    fn letters_are_case_folded() {
        let upper = CanonicalAccountId::parse("ACT-42").unwrap();
        let lower = CanonicalAccountId::parse("act42").unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn separator_only_input_is_rejected() {
        let err = CanonicalAccountId::parse(" - -- ").unwrap_err();
        assert!(matches!(err, LinkageError::InvalidAccountId(raw) if raw == " - -- "));
    }
}
