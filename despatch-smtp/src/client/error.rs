//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server sent a reply that does not follow the SMTP reply grammar.
    #[error("Failed to parse SMTP response: {0}")]
    Parse(String),

    /// A reply line exceeded the maximum accepted length.
    #[error("Response line exceeds {0} bytes")]
    LineTooLong(usize),

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server sent data after the STARTTLS reply, before the handshake.
    #[error("Unexpected data buffered before TLS handshake")]
    BufferedInput,

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

impl ClientError {
    /// `true` when the reply itself was malformed rather than the transport failing.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::LineTooLong(_))
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
