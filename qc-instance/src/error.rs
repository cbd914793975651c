//! Error types for instance lifecycle operations.

use thiserror::Error;

use crate::clients::Operation;
use crate::config::Field;

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Desired configuration is malformed. Raised before any remote call.
    #[error("validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// Well-formed request, but the remote side answered with a non-zero status.
    #[error("{operation} {id} rejected (code {code}): {message}")]
    RemoteRejected {
        operation: Operation,
        id: String,
        code: i32,
        message: String,
    },

    /// The call itself could not complete.
    #[error("{operation} {id} failed: {message}")]
    TransportFailure {
        operation: Operation,
        id: String,
        message: String,
    },

    /// Terminal state not reached within the attempt bound.
    #[error("{id} did not converge after {attempts} attempts (last state: {last_state})")]
    ConvergenceTimeout {
        id: String,
        attempts: u32,
        last_state: String,
    },

    /// Identifier stopped resolving while polling.
    #[error("{id} vanished while polling (attempt {attempt})")]
    ResourceVanished { id: String, attempt: u32 },

    /// The remote side no longer knows the identifier.
    #[error("{operation} {id}: not found")]
    NotFound { operation: Operation, id: String },

    /// A single fetch failed while polling. Not retried.
    #[error("fetching state of {id} failed on attempt {attempt}: {source}")]
    FetchFailed {
        id: String,
        attempt: u32,
        #[source]
        source: Box<Error>,
    },

    /// Update requested a change this revision cannot apply.
    #[error("{id}: unsupported change to {}", join_fields(.fields))]
    UnsupportedChange { id: String, fields: Vec<Field> },

    /// Record store failure.
    #[error("store: {0}")]
    Store(String),
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(Field),

    #[error("invalid instance_type: {0}")]
    InvalidInstanceType(String),

    #[error("instance_class must be 0 or 1, got {0}")]
    InvalidInstanceClass(i64),

    #[error("cpu and memory are required when instance_type is not set")]
    MissingSizing,

    #[error("{0} must not be negative")]
    Negative(Field),

    #[error("record already tracks instance {0}")]
    AlreadyCreated(String),

    #[error("record has no instance identifier")]
    MissingIdentifier,

    #[error("poll settings: {0}")]
    InvalidPollSettings(&'static str),

    #[error("terminal state set is empty")]
    EmptyTerminalSet,
}

fn join_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
