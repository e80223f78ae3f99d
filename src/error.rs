//! Skjold error types

use std::fmt;
use std::time::Duration;

/// Skjold error types
#[derive(Debug, thiserror::Error)]
pub enum SkjoldError {
    // Upstream errors raised by the protected operation
    #[error("model not available: {0}")]
    ModelNotAvailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation failed: {0}")]
    Operation(String),

    /// Terminal failure after every retry attempt was used up.
    ///
    /// The last underlying error is kept as the [`source`](std::error::Error::source).
    #[error("failed after {attempts} attempts: {source}")]
    Generation {
        attempts: u32,
        #[source]
        source: Box<SkjoldError>,
    },

    // Storage errors
    #[error("cache error: {0}")]
    Cache(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Classification of a [`SkjoldError`], used to exclude kinds from retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ModelNotAvailable,
    InvalidResponse,
    RateLimit,
    Timeout,
    Operation,
    Generation,
    Cache,
    Serialization,
    Io,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ModelNotAvailable => "model_not_available",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Operation => "operation",
            ErrorKind::Generation => "generation",
            ErrorKind::Cache => "cache",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

impl SkjoldError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkjoldError::ModelNotAvailable(_) => ErrorKind::ModelNotAvailable,
            SkjoldError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            SkjoldError::RateLimited(_) => ErrorKind::RateLimit,
            SkjoldError::Timeout(_) => ErrorKind::Timeout,
            SkjoldError::Operation(_) => ErrorKind::Operation,
            SkjoldError::Generation { .. } => ErrorKind::Generation,
            SkjoldError::Cache(_) => ErrorKind::Cache,
            SkjoldError::Json(_) => ErrorKind::Serialization,
            SkjoldError::Io(_) => ErrorKind::Io,
            SkjoldError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether this error's kind appears in `kinds`.
    pub fn is_any_of(&self, kinds: &[ErrorKind]) -> bool {
        kinds.contains(&self.kind())
    }

    /// The innermost error, following `Generation` wrappers.
    pub fn root_cause(&self) -> &SkjoldError {
        match self {
            SkjoldError::Generation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Build an `Operation` error from anything printable.
    pub fn operation(err: impl fmt::Display) -> Self {
        SkjoldError::Operation(err.to_string())
    }
}

/// Result type alias for Skjold operations
pub type Result<T> = std::result::Result<T, SkjoldError>;
