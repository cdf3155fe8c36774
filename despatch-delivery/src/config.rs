use std::{path::PathBuf, time::Duration};

use despatch_smtp::CertificatePolicy;
use serde::Deserialize;

use crate::dns::DnsConfig;

const fn default_idle_delay() -> u64 {
    30
}

fn default_failure_store() -> PathBuf {
    PathBuf::from("/var/lib/despatch/failures.json")
}

/// Configuration for outbound delivery.
///
/// ```ron
/// delivery: (
///     domain: "mail.example.org",
///     aliases: ["example.org"],
///     relays: [
///         (name: "example.net", relay_host: "smarthost.example.org", port: 587),
///     ],
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// This agent's own name, used in EHLO/HELO.
    pub domain: String,

    /// Other names that refer to this agent. Never delivered to.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Seconds to sleep after a sweep that found nothing ready (default: 30)
    #[serde(default = "default_idle_delay")]
    pub idle_delay_secs: u64,

    /// Where retry bookkeeping is persisted
    #[serde(default = "default_failure_store")]
    pub failure_store: PathBuf,

    /// Domains delivered through a fixed host instead of their MX records
    #[serde(default)]
    pub relays: Vec<RelayConfig>,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            aliases: Vec::new(),
            idle_delay_secs: default_idle_delay(),
            failure_store: default_failure_store(),
            relays: Vec::new(),
            tls: TlsConfig::default(),
            dns: DnsConfig::default(),
            timeouts: SmtpTimeouts::default(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }

    /// The relay override for `domain`, if any.
    #[must_use]
    pub fn relay_for(&self, domain: &str) -> Option<&RelayConfig> {
        self.relays
            .iter()
            .find(|relay| same_host(&relay.name, domain))
    }

    /// Whether `host` names this agent.
    #[must_use]
    pub fn is_local(&self, host: &str) -> bool {
        same_host(&self.domain, host) || self.aliases.iter().any(|alias| same_host(alias, host))
    }
}

fn same_host(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Deliver everything for `name` through `relay_host`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub name: String,
    pub relay_host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl RelayConfig {
    pub const DEFAULT_PORT: u16 = 25;

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(Self::DEFAULT_PORT)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Accept any server certificate after STARTTLS.
    ///
    /// **SECURITY WARNING**: this makes every upgraded connection open to
    /// interception. Only for testing against self-signed servers.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    #[must_use]
    pub fn policy(&self) -> CertificatePolicy {
        if self.accept_invalid_certs {
            CertificatePolicy::AcceptInvalid
        } else {
            CertificatePolicy::Verify
        }
    }
}

/// Optional deadlines for SMTP operations. Unset means wait indefinitely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect
    #[serde(default)]
    pub connect_secs: Option<u64>,

    /// Each command/reply exchange, including the greeting and the TLS handshake
    #[serde(default)]
    pub command_secs: Option<u64>,

    /// Sending the message body and reading the final reply
    #[serde(default)]
    pub data_secs: Option<u64>,
}

impl SmtpTimeouts {
    #[must_use]
    pub fn connect(&self) -> Option<Duration> {
        self.connect_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn command(&self) -> Option<Duration> {
        self.command_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn data(&self) -> Option<Duration> {
        self.data_secs.map(Duration::from_secs)
    }
}
