//! The delivery scheduler.

use std::sync::Arc;

use chrono::Utc;
use despatch_common::{Shutdown, internal};
use despatch_queue::Queue;
use despatch_smtp::{RustlsUpgrade, TlsUpgrade};

use crate::{
    config::DeliveryConfig,
    connector::{Connector, TcpConnector},
    dns::{DnsResolver, Resolver},
    error::DeliveryError,
    failover::{DomainOutcome, Failover},
    failure::FailureStore,
    smtp_transaction::Environment,
};

/// Summary of one sweep over the queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Mails that were ready to send this sweep.
    pub ready: usize,
    /// Outcome per domain that had ready mail, in sweep order.
    pub outcomes: Vec<(String, DomainOutcome)>,
}

impl CycleReport {
    /// Whether any domain had mail delivered or deferred. Mail left untouched
    /// is ready again straight away, so a sweep without progress is idle.
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, outcome)| outcome.made_progress())
    }
}

/// Sequential delivery loop: one domain at a time, one connection at a time.
///
/// The processor owns the [`FailureStore`]; it is loaded once in
/// [`DeliveryProcessor::init`] and saved after every sweep.
pub struct DeliveryProcessor {
    config: DeliveryConfig,
    queue: Arc<dyn Queue>,
    resolver: Arc<dyn Resolver>,
    connector: Arc<dyn Connector>,
    tls: Arc<dyn TlsUpgrade>,
    failures: FailureStore,
}

impl DeliveryProcessor {
    /// Build a processor with the system resolver, plain TCP and rustls, and
    /// load the failure store.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver or TLS configuration cannot be built,
    /// or the failure store exists but cannot be read.
    pub async fn init(config: DeliveryConfig, queue: Arc<dyn Queue>) -> Result<Self, DeliveryError> {
        internal!("Initialising delivery processor for {} ...", config.domain);

        let resolver = DnsResolver::with_dns_config(&config.dns)?;
        let tls = RustlsUpgrade::new(&config.tls.policy())?;
        let failures = FailureStore::load(&config.failure_store).await?;

        internal!(
            level = INFO,
            "Delivery processor ready: {} relay(s), {} pending failure record(s)",
            config.relays.len(),
            failures.len()
        );

        Ok(Self::with_components(
            config,
            queue,
            Arc::new(resolver),
            Arc::new(TcpConnector),
            Arc::new(tls),
            failures,
        ))
    }

    /// Assemble a processor from explicit collaborators.
    #[must_use]
    pub fn with_components(
        config: DeliveryConfig,
        queue: Arc<dyn Queue>,
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
        tls: Arc<dyn TlsUpgrade>,
        failures: FailureStore,
    ) -> Self {
        Self {
            config,
            queue,
            resolver,
            connector,
            tls,
            failures,
        }
    }

    #[must_use]
    pub const fn failures(&self) -> &FailureStore {
        &self.failures
    }

    /// Sweep every domain with pending mail once, then persist the failure
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be enumerated or the failure store
    /// cannot be saved. The store is saved even when the sweep fails.
    pub async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> Result<CycleReport, DeliveryError> {
        let sweep = self.sweep(shutdown).await;
        let saved = self.failures.save().await;

        let report = sweep?;
        saved?;
        Ok(report)
    }

    async fn sweep(&mut self, shutdown: &mut Shutdown) -> Result<CycleReport, DeliveryError> {
        let domains = self.queue.domains().await?;
        let failover = Failover::new(
            &self.config,
            &*self.resolver,
            &*self.connector,
            Environment {
                local_domain: &self.config.domain,
                queue: &*self.queue,
                tls: &*self.tls,
                timeouts: &self.config.timeouts,
            },
        );

        let mut report = CycleReport::default();
        let now = Utc::now();

        for domain in domains {
            if shutdown.is_triggered() {
                break;
            }

            let mails = match self.queue.list(&domain).await {
                Ok(mails) => mails,
                Err(err) => {
                    internal!(level = ERROR, "Failed to list mail for {domain}: {err}");
                    continue;
                }
            };

            let ready: Vec<_> = mails
                .into_iter()
                .filter(|mail| self.failures.is_ready_to_send(&mail.id, now))
                .collect();

            if ready.is_empty() {
                continue;
            }

            report.ready += ready.len();
            let outcome = failover
                .deliver(&domain, ready, &mut self.failures, shutdown)
                .await;

            internal!(level = DEBUG, "{domain}: {outcome:?}");
            report.outcomes.push((domain, outcome));
        }

        Ok(report)
    }

    /// Run sweeps until shutdown. Sleeps for the idle delay after a sweep that
    /// made no progress, and after a sweep that failed.
    pub async fn serve(mut self, mut shutdown: Shutdown) {
        internal!(level = INFO, "Delivery processor starting");

        let idle_delay = self.config.idle_delay();

        while !shutdown.is_triggered() {
            let idle = match self.run_cycle(&mut shutdown).await {
                Ok(report) => {
                    let progressed = report.made_progress();
                    if progressed {
                        internal!(
                            level = DEBUG,
                            "Sweep attempted {} mail(s) across {} domain(s)",
                            report.ready,
                            report.outcomes.len()
                        );
                    }
                    !progressed
                }
                Err(err) => {
                    internal!(level = ERROR, "Delivery sweep failed: {err}");
                    true
                }
            };

            if idle && shutdown.guard(tokio::time::sleep(idle_delay)).await.is_none() {
                break;
            }
        }

        internal!(level = INFO, "Delivery processor shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<DomainOutcome>) -> CycleReport {
        CycleReport {
            ready: outcomes.len(),
            outcomes: outcomes
                .into_iter()
                .map(|outcome| ("example.test".to_string(), outcome))
                .collect(),
        }
    }

    #[test]
    fn test_untouched_domains_are_idle() {
        assert!(!report(vec![]).made_progress());
        assert!(
            !report(vec![
                DomainOutcome::LoopDetected {
                    exchange: "mx.example.test".to_string(),
                    pending: 1,
                },
                DomainOutcome::Cancelled { pending: 2 },
            ])
            .made_progress()
        );
    }

    #[test]
    fn test_delivered_or_deferred_is_progress() {
        assert!(report(vec![DomainOutcome::Delivered]).made_progress());
        assert!(
            report(vec![
                DomainOutcome::LoopDetected {
                    exchange: "mx.example.test".to_string(),
                    pending: 1,
                },
                DomainOutcome::Deferred {
                    retrying: 1,
                    given_up: 0,
                },
            ])
            .made_progress()
        );
    }
}
