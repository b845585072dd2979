/// Shared error type used across all foliant crates.
///
/// Variants mirror the error taxonomy from the scheduler design: each one
/// is a *kind*, not a wrapped downstream error type, so callers can match
/// on it without depending on provider-specific error types.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Retryable provider/pool failure (timeout, 5xx, connection reset).
    #[error("transient: {0}")]
    Transient(String),

    /// Non-retryable provider/pool failure (invalid request, schema
    /// violation, auth). Consumes the retry budget immediately.
    #[error("permanent: {0}")]
    Permanent(String),

    /// A persistence write failed mid state-transition; the caller must
    /// roll the transition back via `OperationState::reset`.
    #[error("persistence: {0}")]
    Persistence(String),

    /// `Agent::restore_state` was given malformed JSON.
    #[error("malformed agent state: {0}")]
    MalformedState(String),

    /// The operating context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Caller error: unknown work-unit id, missing pool, missing factory.
    #[error("programmer error: {0}")]
    Programmer(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error kind should consume a retry slot but allow
    /// another attempt, as opposed to failing the operation outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
