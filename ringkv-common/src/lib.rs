// ringkv-common - Shared error types for the ringkv cache core.

pub mod error;

pub use error::{CacheError, CacheResult};
