//! Error types for the queue.

use std::io;

use thiserror::Error;

use crate::MailId;

#[derive(Debug, Error)]
pub enum QueueError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode mail metadata: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode mail metadata: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Mail not found: {0}")]
    NotFound(MailId),

    /// The domain cannot be used as a queue partition.
    #[error("Invalid domain: '{0}'")]
    InvalidDomain(String),

    #[error("Invalid queue path: {0}")]
    InvalidPath(String),

    #[error("Mail has no recipients")]
    NoRecipients,

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
