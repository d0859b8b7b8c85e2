use std::path::PathBuf;
use thiserror::Error;

/// Core error types for fwplane
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration document could not be found.
    ///
    /// Fatal to the request; nothing has been written, the last committed
    /// document is still in effect.
    #[error("configuration document missing: {path}")]
    ConfigMissing { path: PathBuf },

    /// The document did not have the structure the patcher expects
    #[error("patch error: {message}")]
    Patch { message: String },

    /// Both reload paths failed after the document was written.
    ///
    /// The document is left as written; the caller must surface the
    /// inconsistency to the operator rather than silently revert.
    #[error("reload error: {message}")]
    Reload {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// An individual live-directive operation failed
    #[error("engine error: {message}")]
    Engine {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Rule store integrity violation or persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Input validation failed
    #[error("validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Rule-store specific errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("IP {0} is already denylisted")]
    Duplicate(String),

    #[error("custom rule limit of {0} reached")]
    LimitReached(usize),

    #[error("data directory not available")]
    DataDirUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
