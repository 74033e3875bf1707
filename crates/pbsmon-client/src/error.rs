use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The scheduler command could not be run or exited nonzero. The
    /// engine treats this as a failed pass and writes nothing.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("scheduler command timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The whole payload was unusable. Malformed individual entries do
    /// not raise this; they surface as parse-error counts in the pass.
    #[error("unparseable scheduler output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
