/// Errors from cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// A resolver asked for the entry it is currently computing.
    #[error("circular resolution of a cache entry is forbidden")]
    Circular,
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
