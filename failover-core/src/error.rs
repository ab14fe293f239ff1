use crate::data::Outcome;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failures reported by a [`Backend`](crate::Backend).
///
/// The variants double as the worker error taxonomy; see [`BackendError::outcome`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl BackendError {
    /// Category recorded for a worker whose write failed with this error.
    ///
    /// Authentication failures after startup are not transient connection errors, but they still
    /// must not stop the run, so they are counted as query errors.
    pub fn outcome(&self) -> Outcome {
        match self {
            BackendError::Connection(_) => Outcome::ConnectionError,
            BackendError::Timeout(_) => Outcome::Timeout,
            BackendError::Query(_) | BackendError::Auth(_) => Outcome::QueryError,
        }
    }
}
