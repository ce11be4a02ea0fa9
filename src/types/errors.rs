//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and map
//! onto the stable RPC error taxonomy clients switch on (§4.7): client
//! errors are returned directly, session-internal failures are captured in
//! the envelope rather than surfacing here, and programmer errors (panics)
//! are caught at the interceptor boundary and converted to `Error::Internal`.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing/malformed field (INVALID_ARGUMENT).
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing identity metadata on the transport (UNAUTHENTICATED).
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Ownership violation (PERMISSION_DENIED).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown pid / session / interrupt (NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition (FAILED_PRECONDITION).
    #[error("failed precondition: {0}")]
    StateTransition(String),

    /// Quota or rate limit exceeded (RESOURCE_EXHAUSTED).
    #[error("resource exhausted: {0}")]
    QuotaExceeded(String),

    /// Duplicate session without force (ALREADY_EXISTS).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Context deadline hit before work began (DEADLINE_EXCEEDED).
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Unexpected failure, including recovered panics (INTERNAL).
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation of an in-flight operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes clients may switch on (§4.7). `Display` yields the
/// exact SCREAMING_SNAKE_CASE token from the spec's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    AlreadyExists,
    DeadlineExceeded,
    Internal,
    Cancelled,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl Error {
    /// Map this error onto its stable RPC error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::InvalidArgument,
            Error::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::StateTransition(_) => ErrorCode::FailedPrecondition,
            Error::QuotaExceeded(_) => ErrorCode::ResourceExhausted,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::Timeout(_) => ErrorCode::DeadlineExceeded,
            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => ErrorCode::Internal,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
