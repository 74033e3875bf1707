use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store schema is version {found}, engine expects {expected}; run `pbsmon init` to migrate")]
    SchemaVersion { found: i32, expected: i32 },

    /// Write contention with a concurrent pass; retryable at the pass
    /// boundary with bounded backoff.
    #[error("store is busy")]
    Busy,

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
