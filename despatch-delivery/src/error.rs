//! Typed errors for delivery, one type per failure scope:
//!
//! - [`CandidateError`]: one MX candidate or relay could not be reached; try the next
//! - [`ConnectionError`]: the session could not be set up; every mail on it is unsent
//! - [`MailError`]: one mail failed; the rest of the batch continues unless
//!   the reply stream is no longer in step
//! - [`DeliveryError`]: infrastructure failure that ends a scheduler cycle
//!
//! Only [`DeliveryError`] is ever returned from the scheduler. The others are
//! logged and turned into retry bookkeeping.

use std::{io, net::SocketAddr, time::Duration};

use despatch_queue::QueueError;
use despatch_smtp::{ClientError, Response};
use thiserror::Error;

use crate::{dns::DnsError, failure::FailureStoreError};

/// A single command/reply exchange that did not go as expected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{command} rejected: {response}")]
    Rejected {
        command: &'static str,
        response: Response,
    },

    #[error("{command} timed out after {}s", timeout.as_secs())]
    TimedOut {
        command: &'static str,
        timeout: Duration,
    },

    #[error("Cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("Failed to resolve {host}: {source}")]
    Resolve { host: String, source: DnsError },

    #[error("No A or AAAA records for {0}")]
    NoAddress(String),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        source: io::Error,
    },

    #[error("Connecting to {address} timed out after {}s", timeout.as_secs())]
    ConnectTimedOut {
        address: SocketAddr,
        timeout: Duration,
    },

    #[error("Cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Greeting: {0}")]
    Greeting(ProtocolError),

    #[error("EHLO/HELO: {0}")]
    Hello(ProtocolError),

    #[error("STARTTLS: {0}")]
    StartTls(ProtocolError),

    #[error("TLS handshake: {0}")]
    Handshake(ClientError),
}

impl ConnectionError {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Greeting(ProtocolError::Cancelled)
                | Self::Hello(ProtocolError::Cancelled)
                | Self::StartTls(ProtocolError::Cancelled)
        )
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Failed to open mail: {0}")]
    Open(#[from] QueueError),

    #[error(transparent)]
    Exchange(#[from] ProtocolError),
}

impl MailError {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Exchange(ProtocolError::Cancelled))
    }

    /// Whether the session can no longer be trusted for further mail. Only a
    /// well-formed refusal, or a mail that could not be opened, leaves the
    /// reply framing intact.
    #[must_use]
    pub const fn ends_session(&self) -> bool {
        matches!(
            self,
            Self::Exchange(
                ProtocolError::Client(_)
                    | ProtocolError::TimedOut { .. }
                    | ProtocolError::Cancelled
            )
        )
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Failure store error: {0}")]
    Store(#[from] FailureStoreError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] ClientError),
}
