//! Store name sanitizing
//!
//! Every store lives in its own namespace on the medium. The namespace is
//! derived from the user-facing store name by replacing every non-word
//! character and prefixing `Cache_`, so arbitrary names ("images@v2",
//! "http://host/api") map to flat, portable directory names.

use crate::error::{StoreError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Sanitized store namespace
///
/// # Examples
///
/// ```
/// use blockstore_rs::StoreName;
///
/// let name = StoreName::new("images@v2").unwrap();
/// assert_eq!(name.as_str(), "Cache_images_v2");
/// assert_eq!(name.fat_path(), "Cache_images_v2/fat");
///
/// assert!(StoreName::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreName {
    raw: String,
    sanitized: String,
}

impl StoreName {
    /// Prefix of every store namespace
    pub const PREFIX: &'static str = "Cache_";

    /// Pattern matching characters that are not allowed in a namespace
    const NON_WORD: &'static str = r"[^A-Za-z0-9_]";

    /// Maximum length of the raw name
    const MAX_LENGTH: usize = 200;

    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();

        if raw.trim().is_empty() {
            return Err(StoreError::InvalidStoreName(
                "store name cannot be empty".to_string(),
            ));
        }

        if raw.len() > Self::MAX_LENGTH {
            return Err(StoreError::InvalidStoreName(format!(
                "store name too long (max {} characters)",
                Self::MAX_LENGTH
            )));
        }

        let sanitized = format!("{}{}", Self::PREFIX, Self::non_word().replace_all(&raw, "_"));
        Ok(StoreName { raw, sanitized })
    }

    fn non_word() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(Self::NON_WORD).expect("non-word pattern compiles"))
    }

    /// The name as given by the caller
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The sanitized namespace
    pub fn as_str(&self) -> &str {
        &self.sanitized
    }

    /// Path of the allocation table stream
    pub fn fat_path(&self) -> String {
        format!("{}/fat", self.sanitized)
    }

    /// Path of the content stream
    pub fn content_path(&self) -> String {
        format!("{}/content", self.sanitized)
    }

    /// Path of the exclusive writer lock
    pub fn lock_path(&self) -> String {
        format!("{}/lock", self.sanitized)
    }
}

impl AsRef<str> for StoreName {
    fn as_ref(&self) -> &str {
        &self.sanitized
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sanitized)
    }
}
