//! Outbound delivery engine.
//!
//! The [`DeliveryProcessor`] sweeps the queue domain by domain. Each domain is
//! handed to the [`Failover`] controller, which walks the relay override or
//! the domain's MX candidates and drives an [`SmtpTransaction`] over each
//! connection. Mail that could not be delivered anywhere has its retry
//! bookkeeping updated in the [`FailureStore`].

mod config;
mod connector;
mod dns;
mod error;
mod failover;
mod failure;
mod processor;
pub mod retry;
mod smtp_transaction;

pub use config::{DeliveryConfig, RelayConfig, SmtpTimeouts, TlsConfig};
pub use connector::{Connector, TcpConnector};
pub use dns::{DnsConfig, DnsError, DnsResolver, MxCandidate, Resolver};
pub use error::{CandidateError, ConnectionError, DeliveryError, MailError, ProtocolError};
pub use failover::{DomainOutcome, Failover};
pub use failure::{FailureRecord, FailureStore, FailureStoreError, Redelivery};
pub use processor::{CycleReport, DeliveryProcessor};
pub use smtp_transaction::{Environment, SmtpTransaction};
