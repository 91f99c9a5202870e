//! Error types for session handling.

use std::fmt;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Renewal error: {0}")]
    Renewal(#[from] RenewalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Failure of a single renewal attempt.
///
/// None of these are retried: the scheduler stops the renewal cycle and the
/// user has to log in again.
#[derive(Debug, Error)]
pub enum RenewalError {
    /// The remote call produced nothing usable (transport error, non-success status).
    #[error("No usable renewal response: {0}")]
    NoResponse(String),

    /// The response lacked the renewed token.
    #[error("Renewal response is missing the Authorization header")]
    MissingAuthHeader,

    /// The expiry was absent, non-numeric or not a positive timestamp.
    #[error("Renewal response has an invalid expiration{}", raw_suffix(.0))]
    InvalidExpiration(Option<String>),
}

impl RenewalError {
    /// Copyable tag of this failure, for observers and status reporting.
    pub fn kind(&self) -> RenewalFailureKind {
        match self {
            Self::NoResponse(_) => RenewalFailureKind::NoResponse,
            Self::MissingAuthHeader => RenewalFailureKind::MissingAuthHeader,
            Self::InvalidExpiration(_) => RenewalFailureKind::InvalidExpiration,
        }
    }
}

fn raw_suffix(raw: &Option<String>) -> String {
    raw.as_deref()
        .map(|value| format!(": {value:?}"))
        .unwrap_or_default()
}

/// Kind of a renewal failure without its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenewalFailureKind {
    NoResponse,
    MissingAuthHeader,
    InvalidExpiration,
}

impl fmt::Display for RenewalFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoResponse => "no_response",
            Self::MissingAuthHeader => "missing_auth_header",
            Self::InvalidExpiration => "invalid_expiration",
        };
        f.write_str(name)
    }
}

/// Errors returned by the initial login.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The backend refused the credentials.
    #[error("Authentication rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The backend accepted the login but the token headers were unusable.
    #[error("Invalid login response: {0}")]
    InvalidResponse(#[from] RenewalError),

    /// The issued credential could not be persisted.
    #[error("Failed to persist credential: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn rejected(status: u16, reason: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            reason: reason.into(),
        }
    }
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Refusing to persist an empty token")]
    EmptyToken,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
