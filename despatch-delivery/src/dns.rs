//! DNS resolution for mail delivery.
//!
//! MX lookup with the implicit-MX rule from RFC 5321 section 5.1, and address
//! lookup preferring A records over AAAA.

use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DnsError {
    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] ResolveError),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),
}

/// Configuration for the DNS resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Per-query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per query before giving up (default: 2)
    #[serde(default = "default_attempts")]
    pub attempts: usize,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_attempts() -> usize {
    2
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
        }
    }
}

/// One mail exchanger for a domain. Lower preference is tried first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxCandidate {
    pub exchange: String,
    pub preference: u16,
}

impl MxCandidate {
    #[must_use]
    pub fn new(exchange: impl Into<String>, preference: u16) -> Self {
        Self {
            exchange: exchange.into(),
            preference,
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Mail exchangers for `domain`, in the order DNS returned them.
    async fn query_mx(&self, domain: &str) -> Result<Vec<MxCandidate>, DnsError>;

    /// An address for `host`, or `None` if it has neither A nor AAAA records.
    async fn query_address(&self, host: &str) -> Result<Option<IpAddr>, DnsError>;
}

/// Parse `host` as an IP literal, with or without the `[...]` of an SMTP
/// address literal.
#[must_use]
pub fn ip_literal(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.strip_prefix("IPv6:").unwrap_or(host);
    host.parse().ok()
}

/// [`Resolver`] backed by the system's configured name servers.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn with_dns_config(dns_config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(dns_config.timeout_secs);
        opts.attempts = dns_config.attempts;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver })
    }

    fn implicit_mx(domain: &str) -> Vec<MxCandidate> {
        debug!("No MX records for {domain}, using the domain itself");
        vec![MxCandidate::new(domain, 0)]
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn query_mx(&self, domain: &str) -> Result<Vec<MxCandidate>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let candidates: Vec<_> = lookup
                    .iter()
                    .map(|mx| {
                        let exchange = mx.exchange().to_utf8();
                        MxCandidate::new(exchange.trim_end_matches('.'), mx.preference())
                    })
                    .filter(|candidate| !candidate.exchange.is_empty())
                    .collect();

                if candidates.is_empty() {
                    return Ok(Self::implicit_mx(domain));
                }

                debug!("Resolved {} MX record(s) for {domain}", candidates.len());
                Ok(candidates)
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => Ok(Self::implicit_mx(domain)),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }

    async fn query_address(&self, host: &str) -> Result<Option<IpAddr>, DnsError> {
        if let Some(ip) = ip_literal(host) {
            return Ok(Some(ip));
        }

        match self.resolver.ipv4_lookup(host).await {
            Ok(lookup) => {
                if let Some(a) = lookup.iter().next() {
                    return Ok(Some(IpAddr::V4(a.0)));
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {}
            Err(err) => return Err(DnsError::LookupFailed(err)),
        }

        debug!("No A records for {host}, trying AAAA");

        match self.resolver.ipv6_lookup(host).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|aaaa| IpAddr::V6(aaaa.0))),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => Ok(None),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}
