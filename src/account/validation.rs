//! Account name canonicalization
//!
//! Account identifiers are case-insensitive. Every name entering the core
//! goes through [`AccountName::new`], which lowercases and checks the format.

use std::fmt;

/// Validation errors for account names
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid length for account name: expected {min}-{max}, got {actual}")]
    InvalidLength {
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("Invalid account name '{value}' (expected: [a-z0-9_.-])")]
    InvalidFormat { value: String },
}

/// Canonical (lowercase) account name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountName(String);

impl AccountName {
    pub const MIN_LEN: usize = 1;
    pub const MAX_LEN: usize = 64;

    /// Canonicalize and validate
    ///
    /// # Validation Rules
    /// - Lowercased before checking
    /// - Length: 1-64 characters
    /// - Characters: `a-z`, `0-9`, `_`, `.`, `-`
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        let canonical = raw.trim().to_lowercase();
        let len = canonical.chars().count();
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
            return Err(ValidationError::InvalidLength {
                min: Self::MIN_LEN,
                max: Self::MAX_LEN,
                actual: len,
            });
        }

        if !canonical
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        {
            return Err(ValidationError::InvalidFormat { value: canonical });
        }

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AccountName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase an identifier without validating it (lookups only)
#[inline]
pub fn canonical(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases() {
        let name = AccountName::new("  Alice ").unwrap();
        assert_eq!(name.as_str(), "alice");
        assert_eq!(name.to_string(), "alice");
    }

    #[test]
    fn test_rejects_empty_and_long() {
        assert!(matches!(
            AccountName::new(""),
            Err(ValidationError::InvalidLength { actual: 0, .. })
        ));
        let long = "a".repeat(65);
        assert!(AccountName::new(&long).is_err());
    }

    #[test]
    fn test_rejects_bad_chars() {
        assert_eq!(
            AccountName::new("bob smith"),
            Err(ValidationError::InvalidFormat {
                value: "bob smith".to_string()
            })
        );
        assert!(AccountName::new("*").is_err());
        assert!(AccountName::new("conn_1.eu-west").is_ok());
    }
}
