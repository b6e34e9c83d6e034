//! Social account handles

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::{Validate, ValidationError, ValidationErrors};

/// A validated social platform handle, e.g. `creator.studio`.
///
/// A leading `@` is accepted on input and stripped. Handles are
/// compared case-insensitively by storing them lowercased, which is
/// how the platforms treat them too.
#[derive(Clone, Serialize, Deserialize, Validate, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Handle {
    #[validate(length(min = 1, max = 64))]
    #[validate(custom = "allowed_characters")]
    #[validate(custom = "no_edge_dots")]
    inner: String,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handle").field(&self.inner).finish()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.inner)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for Handle {
    type Err = ValidationErrors;

    fn from_str(s: &str) -> Result<Self, ValidationErrors> {
        let trimmed = s.trim();
        let handle = Self {
            inner: trimmed
                .strip_prefix('@')
                .unwrap_or(trimmed)
                .to_lowercase(),
        };
        handle.validate()?;
        Ok(handle)
    }
}

impl TryFrom<String> for Handle {
    type Error = ValidationErrors;

    fn try_from(value: String) -> Result<Self, ValidationErrors> {
        value.parse()
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.inner
    }
}

impl Handle {
    /// The handle without the leading `@`
    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

fn allowed_characters(handle: &str) -> Result<(), ValidationError> {
    if handle
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        Ok(())
    } else {
        Err(ValidationError::new(
            "Handles may only contain letters, digits, underscores and dots",
        ))
    }
}

fn no_edge_dots(handle: &str) -> Result<(), ValidationError> {
    if handle.starts_with('.') || handle.ends_with('.') || handle.contains("..") {
        Err(ValidationError::new(
            "Handles can't start or end with a dot or contain consecutive dots",
        ))
    } else {
        Ok(())
    }
}
