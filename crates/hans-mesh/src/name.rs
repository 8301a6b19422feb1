//! Follower identities

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// The recipient selector that addresses every follower
pub const ALL: &str = "all";

/// Error type for name validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameValidationError {
    /// The name string is empty
    Empty,
    /// The name has leading or trailing whitespace
    LeadingTrailingWhitespace,
    /// The name contains invalid characters
    InvalidCharacters,
    /// The name collides with a reserved selector
    Reserved,
}

impl fmt::Display for NameValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "name cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "name can only contain alphanumeric characters, hyphens, underscores, and dots"
            ),
            Self::Reserved => write!(f, "'{ALL}' is reserved for broadcast"),
        }
    }
}

impl std::error::Error for NameValidationError {}

/// Human-readable, process-scoped name of a follower
///
/// Valid names:
/// - Non-empty
/// - No leading/trailing whitespace
/// - Only alphanumeric, hyphens, underscores, dots
/// - Not the broadcast selector `all` (any casing)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FollowerName(String);

impl FollowerName {
    /// Parse and validate a follower name
    ///
    /// ```
    /// use hans_mesh::FollowerName;
    ///
    /// assert!(FollowerName::parse("scout-1").is_ok());
    /// assert!(FollowerName::parse("").is_err());
    /// assert!(FollowerName::parse("all").is_err());
    /// assert!(FollowerName::parse("a b").is_err());
    /// ```
    pub fn parse(name: impl AsRef<str>) -> Result<Self, NameValidationError> {
        let s = name.as_ref();

        if s.is_empty() {
            return Err(NameValidationError::Empty);
        }

        if s != s.trim() {
            return Err(NameValidationError::LeadingTrailingWhitespace);
        }

        if !s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(NameValidationError::InvalidCharacters);
        }

        if s.eq_ignore_ascii_case(ALL) {
            return Err(NameValidationError::Reserved);
        }

        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FollowerName {
    type Err = NameValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FollowerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FollowerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for FollowerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
