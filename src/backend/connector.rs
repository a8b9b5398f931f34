use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Result;
use crate::protocol::PacketIo;

/// Opens packet channels to backend addresses
pub trait BackendConnector: Send + Sync {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<PacketIo>>;
}

/// Supplies the backend channel to the first handshake
pub trait BackendChannelProvider: Send + Sync {
    fn backend_channel(&self) -> BoxFuture<'_, Result<PacketIo>>;
}

/// TCP connector used by the proxy process
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl BackendConnector for TcpConnector {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<PacketIo>> {
        Box::pin(async move {
            let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
                })??;
            stream.set_nodelay(true)?;
            debug!(addr = addr, "Connected to backend");
            Ok(PacketIo::new(stream, addr))
        })
    }
}

/// Binds a connector to one address for the first handshake
pub(crate) struct AddrProvider<'a> {
    pub connector: &'a dyn BackendConnector,
    pub addr: &'a str,
    pub connect_timeout: Duration,
}

impl BackendChannelProvider for AddrProvider<'_> {
    fn backend_channel(&self) -> BoxFuture<'_, Result<PacketIo>> {
        Box::pin(async move {
            timeout(self.connect_timeout, self.connector.connect(self.addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", self.addr),
                    )
                })?
        })
    }
}
