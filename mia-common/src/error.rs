//! Common error types for MIA

use thiserror::Error;

/// Common result type for MIA operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of failures coming back from an external provider.
///
/// `Auth`, `BadRequest` and `InvalidResponse` are terminal: retrying cannot
/// help and callers must fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Provider rejected our credentials (401/403)
    Auth,
    /// Provider rejected the request shape (400/404/422)
    BadRequest,
    /// Provider answered with a body we cannot parse
    InvalidResponse,
    /// Provider asked us to slow down (429)
    RateLimited,
    /// Provider-side failure (5xx)
    Unavailable,
    /// Transport-level failure (connect, timeout, TLS)
    Network,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Unavailable
                | ProviderErrorKind::Network
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::BadRequest => "bad_request",
            ProviderErrorKind::InvalidResponse => "invalid_response",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Unavailable => "unavailable",
            ProviderErrorKind::Network => "network",
        }
    }
}

/// Common error types across MIA services
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Another operation currently holds the lock for this resource.
    #[error("Busy: {0}")]
    Busy(String),

    /// Circuit breaker is open; no provider call was made.
    #[error("Circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    #[error("Provider error ({}): {message}", kind.as_str())]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Error::Provider {
            kind,
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation in place can succeed.
    ///
    /// Circuit-open is deliberately non-retryable here: the breaker already
    /// gates recovery, hammering it defeats the fast-fail.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { kind, .. } => kind.is_retryable(),
            Error::Database(_) | Error::Io(_) => true,
            _ => false,
        }
    }
}
