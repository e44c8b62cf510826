//! Error kinds shared across the whole workspace.
//!
//! Library crates return `Error` with `?`; only the CLI binary wraps things
//! in `anyhow`. The RPC layer maps each kind to an HTTP status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Requested entity (user, stream, account, app registration, status)
    /// does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied value is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unauthenticated call, or invite code required but absent/wrong.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An upstream Mastodon call failed. `code` carries the HTTP status
    /// when one was received.
    #[error("upstream error (status {code:?}): {message}")]
    Upstream { code: Option<u16>, message: String },

    /// Duplicate insertion at a uniqueness boundary.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invariant violation, migration failure, database consistency error.
    /// Always a bug.
    #[error("internal error: {0}")]
    Internal(String),

    /// Sentinel: roll back the surrounding transaction but treat the call
    /// as success. Must never reach an external caller.
    #[error("clean abort")]
    CleanAbort,
}

impl Error {
    pub fn upstream(code: Option<u16>, message: impl Into<String>) -> Self {
        Error::Upstream {
            code,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Internal(format!("database error: {other}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
