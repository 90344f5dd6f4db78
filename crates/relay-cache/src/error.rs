//! Cache-local failures.

use thiserror::Error;

/// Errors raised by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An invalidation pattern did not compile to a usable matcher.
    #[error("invalid invalidation pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern as submitted.
        pattern: String,
        /// The underlying regex failure.
        #[source]
        source: regex::Error,
    },
}

impl CacheError {
    pub(crate) fn invalid_pattern(pattern: impl Into<String>, source: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            source,
        }
    }
}
