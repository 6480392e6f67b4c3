//! # Error Types
//!
//! Shared error type for the cache core and its callers.
//!
//! ## Design Principles
//!
//! 1. **Typed Construction Errors**: invalid configuration is rejected at
//!    `Cache::new` with no partial state retained.
//! 2. **Lifecycle Errors**: operations issued after `close()` fail uniformly.
//! 3. **Opaque Loader Errors**: a user loader's error is carried as a message
//!    rather than threading an arbitrary error type through the public API.

use std::fmt;

/// Errors surfaced at the cache's API boundary.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// `cap_bytes` was not a positive number at construction.
    #[error("invalid capacity: must be greater than zero")]
    InvalidCapacity,

    /// `ttl` was not a positive duration at construction.
    #[error("invalid ttl: must be greater than zero")]
    InvalidTtl,

    /// `shards` was zero or not a power of two.
    #[error("invalid shard count: must be a non-zero power of two")]
    InvalidShardCount,

    /// The cache has been closed; no further operations are permitted.
    #[error("cache is closed")]
    Closed,

    /// The caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The user-supplied loader returned an error; the cache was not mutated.
    #[error("loader failed: {0}")]
    Loader(String),
}

impl CacheError {
    /// Builds a [`CacheError::Loader`] from any displayable loader error.
    pub fn from_loader<E: fmt::Display>(err: E) -> Self {
        CacheError::Loader(err.to_string())
    }
}

/// Crate-wide result alias.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_error_carries_message() {
        let err = CacheError::from_loader("boom");
        assert_eq!(err, CacheError::Loader("boom".to_string()));
        assert_eq!(err.to_string(), "loader failed: boom");
    }

    #[test]
    fn configuration_errors_have_stable_messages() {
        assert_eq!(
            CacheError::InvalidCapacity.to_string(),
            "invalid capacity: must be greater than zero"
        );
        assert_eq!(
            CacheError::InvalidShardCount.to_string(),
            "invalid shard count: must be a non-zero power of two"
        );
    }
}
