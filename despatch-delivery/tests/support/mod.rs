#![allow(dead_code)]

pub mod mock_server;

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use despatch_delivery::{Connector, DnsError, MxCandidate, Resolver};
use despatch_queue::{MailReference, MemoryQueue, Queue};
use despatch_smtp::{BoxedIo, TlsUpgrade, client};
use tokio::net::TcpStream;

/// Resolver answering from fixed tables.
///
/// Domains without an MX entry get the implicit MX, like the real resolver.
/// Hosts that parse as IP addresses resolve to themselves.
#[derive(Default)]
pub struct StaticResolver {
    mx: HashMap<String, Vec<MxCandidate>>,
    addresses: HashMap<String, IpAddr>,
    mx_queries: Mutex<Vec<String>>,
}

impl StaticResolver {
    #[must_use]
    pub fn with_mx(mut self, domain: &str, candidates: &[(&str, u16)]) -> Self {
        self.mx.insert(
            domain.to_string(),
            candidates
                .iter()
                .map(|(exchange, preference)| MxCandidate::new(*exchange, *preference))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn with_address(mut self, host: &str, ip: IpAddr) -> Self {
        self.addresses.insert(host.to_string(), ip);
        self
    }

    pub fn mx_queries(&self) -> Vec<String> {
        self.mx_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn query_mx(&self, domain: &str) -> Result<Vec<MxCandidate>, DnsError> {
        self.mx_queries.lock().unwrap().push(domain.to_string());
        Ok(self
            .mx
            .get(domain)
            .cloned()
            .unwrap_or_else(|| vec![MxCandidate::new(domain, 0)]))
    }

    async fn query_address(&self, host: &str) -> Result<Option<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse() {
            return Ok(Some(ip));
        }
        Ok(self.addresses.get(host).copied())
    }
}

/// Connector that sends port-25 connections for a given IP to a mock server
/// instead, and records every attempt. Unrouted addresses are refused.
#[derive(Default)]
pub struct RoutingConnector {
    routes: HashMap<IpAddr, SocketAddr>,
    attempts: Mutex<Vec<SocketAddr>>,
}

impl RoutingConnector {
    #[must_use]
    pub fn route(mut self, ip: IpAddr, to: SocketAddr) -> Self {
        self.routes.insert(ip, to);
        self
    }

    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for RoutingConnector {
    async fn connect(&self, address: SocketAddr) -> io::Result<BoxedIo> {
        self.attempts.lock().unwrap().push(address);

        let target = self.routes.get(&address.ip()).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no route in test")
        })?;

        Ok(Box::new(TcpStream::connect(target).await?))
    }
}

/// "Upgrade" that hands the stream back untouched, so a plaintext mock server
/// can accept STARTTLS.
#[derive(Default)]
pub struct PassthroughTls {
    upgrades: Mutex<Vec<String>>,
}

impl PassthroughTls {
    pub fn upgrades(&self) -> Vec<String> {
        self.upgrades.lock().unwrap().clone()
    }
}

#[async_trait]
impl TlsUpgrade for PassthroughTls {
    async fn upgrade(&self, stream: BoxedIo, server_name: &str) -> client::Result<BoxedIo> {
        self.upgrades.lock().unwrap().push(server_name.to_string());
        Ok(stream)
    }
}

pub fn ip(address: &str) -> IpAddr {
    address.parse().unwrap()
}

pub async fn enqueue(
    queue: &Arc<MemoryQueue>,
    domain: &str,
    recipients: &[&str],
    body: &str,
) -> MailReference {
    let recipients: Vec<String> = recipients.iter().map(ToString::to_string).collect();
    queue
        .enqueue(domain, "sender@origin.test", &recipients, body.as_bytes())
        .await
        .unwrap()
}
