use thiserror::Error;

/// Failures reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    /// A uniqueness constraint rejected the write (e.g. a duplicate reaction).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("channel closed")]
    Closed,
    /// The store answered, but with a row the client cannot use.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Transient errors are retried by the connection machinery and never
    /// surface as fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::Closed => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Conflict(_) | Self::NotFound | Self::Malformed(_) => false,
        }
    }
}

/// A row from the remote store that could not be turned into a model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable timestamp '{0}'")]
    BadTimestamp(String),
}
