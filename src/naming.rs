//! Config identifier validation and cache-key derivation.
//!
//! Config ids come from URLs and file stems, and are used to build paths
//! under the cache directory, so they are validated before any filesystem
//! access. Admissible characters are ASCII letters, digits, underscore,
//! hyphen, and anything at or above U+0080. Path separators, dot-files,
//! `..`, and the Windows reserved device names are rejected outright.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved device names that must not be used as identifiers
/// (case-insensitive), even on platforms that would tolerate them.
const RESERVED_NAMES: &[&str] = &["con", "prn", "aux", "nul"];

/// Error returned when an identifier fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid config name '{name}': {reason}")]
pub struct InvalidName {
    /// The rejected input.
    pub name: String,
    /// Why the input was rejected.
    pub reason: String,
}

impl InvalidName {
    fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A validated config identifier.
///
/// Construction goes through [`ConfigId::new`], which applies the full
/// rejection rules; once constructed the id is safe to interpolate into
/// cache paths via [`ConfigId::cache_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(String);

impl ConfigId {
    /// Validate and normalize an identifier.
    ///
    /// A trailing `.json` suffix is stripped, so callers may pass either a
    /// bare id or a config file name. Validation is idempotent: a valid id
    /// passes through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidName`] for empty input, path separators, `.` and
    /// `..`, leading dots, reserved device names, or any character outside
    /// the admissible set.
    pub fn new(name: &str) -> Result<Self, InvalidName> {
        let name = name.strip_suffix(".json").unwrap_or(name);

        if name.is_empty() {
            return Err(InvalidName::new(name, "name is empty"));
        }
        if name == "." || name == ".." {
            return Err(InvalidName::new(name, "name is a relative path"));
        }
        if name.starts_with('.') {
            return Err(InvalidName::new(name, "name starts with a dot"));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(InvalidName::new(name, "name contains a path separator"));
        }
        if name.contains("..") {
            return Err(InvalidName::new(name, "name contains '..'"));
        }
        if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
            return Err(InvalidName::new(name, "name is a reserved device name"));
        }
        if let Some(bad) = name.chars().find(|c| !is_admissible(*c)) {
            return Err(InvalidName::new(
                name,
                format!("character '{bad}' is not allowed"),
            ));
        }

        Ok(Self(name.to_owned()))
    }

    /// The validated identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the filesystem-safe cache key for this id.
    ///
    /// Runs of whitespace collapse to a single `_`; any byte outside the
    /// admissible set becomes `_`. For an already-valid id this is the
    /// identity, which keeps the function idempotent.
    #[must_use]
    pub fn cache_key(&self) -> String {
        to_cache_key(&self.0)
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ConfigId {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Whether a character may appear in an identifier or cache key.
fn is_admissible(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || (c as u32) >= 0x80
}

/// Normalize an arbitrary string into a filesystem-safe cache key.
///
/// Whitespace runs become a single `_`, everything else outside the
/// admissible set becomes `_`. Idempotent.
#[must_use]
pub fn to_cache_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut in_whitespace = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                key.push('_');
            }
            in_whitespace = true;
        } else {
            in_whitespace = false;
            key.push(if is_admissible(c) { c } else { '_' });
        }
    }
    key
}
