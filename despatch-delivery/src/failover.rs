//! Per-domain delivery across the relay override or the MX candidates.

use std::net::SocketAddr;

use chrono::Utc;
use despatch_common::{Shutdown, internal};
use despatch_queue::{MailReference, QueueError};
use despatch_smtp::BoxedIo;

use crate::{
    config::DeliveryConfig,
    connector::Connector,
    dns::{MxCandidate, Resolver},
    error::CandidateError,
    failure::{FailureStore, Redelivery},
    smtp_transaction::{Environment, SmtpTransaction},
};

const SMTP_PORT: u16 = 25;

/// What happened to one domain's mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainOutcome {
    /// Every mail was delivered.
    Delivered,
    /// Some mail is still queued for a later attempt, and some may have been
    /// dropped because their retries ran out.
    Deferred { retrying: usize, given_up: usize },
    /// An MX candidate pointed back at this agent. Nothing was attempted past
    /// that point and no retry bookkeeping was touched.
    LoopDetected { exchange: String, pending: usize },
    /// Shutdown interrupted the attempt; unsent mail was left as it was.
    Cancelled { pending: usize },
}

impl DomainOutcome {
    /// Whether the queue or the retry bookkeeping changed. A loop-guarded or
    /// cancelled domain is left exactly as it was found.
    #[must_use]
    pub const fn made_progress(&self) -> bool {
        matches!(self, Self::Delivered | Self::Deferred { .. })
    }
}

/// Walks the delivery targets for one domain until its mail is delivered or
/// the targets run out.
pub struct Failover<'a> {
    config: &'a DeliveryConfig,
    resolver: &'a dyn Resolver,
    connector: &'a dyn Connector,
    env: Environment<'a>,
}

impl<'a> Failover<'a> {
    pub const fn new(
        config: &'a DeliveryConfig,
        resolver: &'a dyn Resolver,
        connector: &'a dyn Connector,
        env: Environment<'a>,
    ) -> Self {
        Self {
            config,
            resolver,
            connector,
            env,
        }
    }

    /// Deliver `mails` for `domain`, then settle the retry bookkeeping of
    /// whatever is left.
    #[tracing::instrument(level = "debug", skip_all, fields(domain = %domain, mails = mails.len()))]
    pub async fn deliver(
        &self,
        domain: &str,
        mails: Vec<MailReference>,
        failures: &mut FailureStore,
        shutdown: &mut Shutdown,
    ) -> DomainOutcome {
        let pending = if let Some(relay) = self.config.relay_for(domain) {
            internal!(
                level = DEBUG,
                "Delivering {domain} through relay {}:{}",
                relay.relay_host,
                relay.port()
            );
            self.attempt(&relay.relay_host, relay.port(), mails, failures, shutdown)
                .await
        } else {
            match self.via_mx(domain, mails, failures, shutdown).await {
                Ok(pending) => pending,
                Err(outcome) => return outcome,
            }
        };

        if pending.is_empty() {
            return DomainOutcome::Delivered;
        }

        if shutdown.is_triggered() {
            return DomainOutcome::Cancelled {
                pending: pending.len(),
            };
        }

        self.reconcile(pending, failures).await
    }

    async fn via_mx(
        &self,
        domain: &str,
        mails: Vec<MailReference>,
        failures: &mut FailureStore,
        shutdown: &mut Shutdown,
    ) -> Result<Vec<MailReference>, DomainOutcome> {
        let mut candidates = match shutdown.guard(self.resolver.query_mx(domain)).await {
            Some(Ok(candidates)) => candidates,
            Some(Err(err)) => {
                internal!(level = WARN, "MX lookup for {domain} failed: {err}");
                Vec::new()
            }
            None => {
                return Err(DomainOutcome::Cancelled {
                    pending: mails.len(),
                });
            }
        };

        // Stable, so equal preferences keep the order DNS gave them.
        candidates.sort_by_key(|candidate| candidate.preference);

        let mut pending = mails;
        for MxCandidate {
            exchange,
            preference,
        } in candidates
        {
            if self.config.is_local(&exchange) {
                internal!(
                    level = WARN,
                    "MX {exchange} for {domain} points back at this host, not delivering"
                );
                return Err(DomainOutcome::LoopDetected {
                    exchange,
                    pending: pending.len(),
                });
            }

            if shutdown.is_triggered() {
                break;
            }

            internal!(
                level = DEBUG,
                "Trying MX {exchange} (preference {preference}) for {domain}"
            );
            pending = self
                .attempt(&exchange, SMTP_PORT, pending, failures, shutdown)
                .await;

            if pending.is_empty() {
                break;
            }
        }

        Ok(pending)
    }

    /// Run one connection against `host`. Every mail is returned if the host
    /// cannot be reached.
    async fn attempt(
        &self,
        host: &str,
        port: u16,
        mails: Vec<MailReference>,
        failures: &mut FailureStore,
        shutdown: &mut Shutdown,
    ) -> Vec<MailReference> {
        let stream = match self.connect(host, port, shutdown).await {
            Ok(stream) => stream,
            Err(CandidateError::Cancelled) => return mails,
            Err(err) => {
                internal!(level = WARN, "Skipping {host}: {err}");
                return mails;
            }
        };

        SmtpTransaction::new(self.env, host, failures, shutdown)
            .run(stream, mails)
            .await
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        shutdown: &mut Shutdown,
    ) -> Result<BoxedIo, CandidateError> {
        let ip = shutdown
            .guard(self.resolver.query_address(host))
            .await
            .ok_or(CandidateError::Cancelled)?
            .map_err(|source| CandidateError::Resolve {
                host: host.to_string(),
                source,
            })?
            .ok_or_else(|| CandidateError::NoAddress(host.to_string()))?;

        let address = SocketAddr::new(ip, port);
        let connect = self.connector.connect(address);

        let connected = match self.env.timeouts.connect() {
            Some(timeout) => shutdown
                .guard(tokio::time::timeout(timeout, connect))
                .await
                .ok_or(CandidateError::Cancelled)?
                .map_err(|_| CandidateError::ConnectTimedOut { address, timeout })?,
            None => shutdown
                .guard(connect)
                .await
                .ok_or(CandidateError::Cancelled)?,
        };

        connected.map_err(|source| CandidateError::Connect { address, source })
    }

    /// Count a failed attempt against every mail still pending, dropping
    /// those whose retries are exhausted.
    async fn reconcile(
        &self,
        pending: Vec<MailReference>,
        failures: &mut FailureStore,
    ) -> DomainOutcome {
        let now = Utc::now();
        let mut retrying = 0;
        let mut given_up = 0;

        for mail in pending {
            match failures.should_attempt_redelivery(&mail.id, now) {
                Redelivery::Retry { retries } => {
                    internal!(
                        level = INFO,
                        "Mail {} for {} deferred (retry {retries})",
                        mail.id,
                        mail.domain
                    );
                    retrying += 1;
                }
                Redelivery::GiveUp => {
                    // No bounce is generated; the sender is not notified.
                    internal!(
                        level = WARN,
                        "Giving up on mail {} for {} from {}, dropping it",
                        mail.id,
                        mail.domain,
                        mail.sender
                    );
                    match self.env.queue.delete(&mail).await {
                        Ok(()) | Err(QueueError::NotFound(_)) => {
                            failures.remove(&mail.id);
                            given_up += 1;
                        }
                        Err(err) => {
                            internal!(
                                level = ERROR,
                                "Failed to drop mail {} from the queue: {err}",
                                mail.id
                            );
                        }
                    }
                }
            }
        }

        DomainOutcome::Deferred { retrying, given_up }
    }
}
