//! Error types for wirevend

use thiserror::Error;

/// Result type alias using the wirevend Error
pub type Result<T> = std::result::Result<T, Error>;

/// Wirevend error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("Gateway rejected operation: {0}")]
    GatewayRejected(String),

    #[error("Gateway configuration malformed: {0}")]
    GatewayConfigMalformed(String),

    #[error("Key generation unavailable: {0}")]
    KeyGenUnavailable(String),

    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transport-level and worth retrying.
    ///
    /// Pool exhaustion and gateway rejections are deliberately not transient:
    /// retrying them without operator intervention cannot succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::GatewayUnreachable(_) | Error::Io(_))
    }
}
