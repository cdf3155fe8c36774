use std::{io, net::SocketAddr};

use async_trait::async_trait;
use despatch_smtp::BoxedIo;
use tokio::net::TcpStream;

/// Opens the byte stream a delivery attempt runs over.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: SocketAddr) -> io::Result<BoxedIo>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: SocketAddr) -> io::Result<BoxedIo> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
