use std::io;

use kernel::{EntryId, GuestLinkId, ValidationError};
use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Storage failures. Not-found and validation variants are always
/// distinguishable from faults so callers can map them to client errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("guest link not found: {0}")]
    GuestLinkNotFound(GuestLinkId),

    #[error("blob not found in {table} for key {key}")]
    BlobNotFound { table: &'static str, key: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("declared size {expected} bytes but stream delivered {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage fault: {0}")]
    Storage(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EntryNotFound(_) | Error::GuestLinkNotFound(_) | Error::BlobNotFound { .. }
        )
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::SizeMismatch { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref f, ref msg)
                if f.code == ErrorCode::ConstraintViolation =>
            {
                Error::Constraint(msg.clone().unwrap_or_else(|| f.to_string()))
            }
            e => Error::Storage(e),
        }
    }
}
