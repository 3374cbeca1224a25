//! Error types for the caching core
//!
//! One central error enum covers every operation; smaller per-operation
//! outcome enums (write outcomes, enqueue outcomes) live next to the
//! components that produce them and are not errors.

use thiserror::Error;

/// Errors produced by cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying filesystem or network I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A per-key write lock could not be acquired in time
    #[error("lock timeout for key {0}")]
    LockTimeout(String),

    /// A coalesced waiter exceeded its timeout before the factory finished
    #[error("coalescing timeout for key {0}")]
    CoalescingTimeout(String),

    /// The artifact factory failed; surfaced to the calling task only
    #[error("factory failed: {0}")]
    FactoryFailed(String),

    /// Eviction could not free enough space for a reservation
    #[error("space exhausted: needed {needed} bytes, limit {limit}")]
    SpaceExhausted {
        /// Bytes the reservation required
        needed: u64,
        /// Configured capacity
        limit: u64,
    },

    /// Another process holds the shard log lock; fatal at startup
    #[error("cache directory already mounted by another process: {0}")]
    InstanceConflict(String),

    /// A persisted bloom checkpoint failed validation
    #[error("corrupt bloom checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Two providers were registered under the same name
    #[error("provider name already registered: {0}")]
    ProviderNameTaken(String),

    /// Construction parameters were out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The component has been stopped and rejects new callers
    #[error("component stopped")]
    Stopped,

    /// The operation was cancelled through its token
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything without a dedicated variant
    #[error("{0}")]
    Other(String),
}

/// Result type for cache operations
pub type CacheOpResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CacheError = io.into();
        assert!(matches!(err, CacheError::Io(_)));
    }

    #[test]
    fn test_display_includes_context() {
        let err = CacheError::SpaceExhausted {
            needed: 1024,
            limit: 512,
        };
        let text = err.to_string();
        assert!(text.contains("1024"));
        assert!(text.contains("512"));
    }
}
