use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendConnManager, BackendConnector, ManagerConfig};
use crate::error::Result;
use crate::protocol::{capabilities::CLIENT_PROTOCOL_41, AsyncStream, Command, ErrPacket, PacketIo};
use crate::router::Router;

/// Accepts client streams and runs one [`ClientConnection`] per stream
pub struct Driver {
    router: Arc<dyn Router>,
    connector: Arc<dyn BackendConnector>,
    config: ManagerConfig,
    frontend_tls: Option<Arc<rustls::ServerConfig>>,
    backend_tls: Option<Arc<rustls::ClientConfig>>,
    next_id: AtomicU64,
}

impl Driver {
    pub fn new(router: Arc<dyn Router>, connector: Arc<dyn BackendConnector>, config: ManagerConfig) -> Self {
        Self {
            router,
            connector,
            config,
            frontend_tls: None,
            backend_tls: None,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_tls(
        mut self,
        frontend_tls: Option<Arc<rustls::ServerConfig>>,
        backend_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        self.frontend_tls = frontend_tls;
        self.backend_tls = backend_tls;
        self
    }

    /// Wrap an accepted stream with a fresh connection id
    pub fn connection<S: AsyncStream + 'static>(&self, stream: S, peer: impl Into<String>) -> ClientConnection {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ClientConnection {
            client: PacketIo::new(stream, peer),
            manager: Arc::new(BackendConnManager::new(
                connection_id,
                self.connector.clone(),
                self.config.clone(),
            )),
            router: self.router.clone(),
            frontend_tls: self.frontend_tls.clone(),
            backend_tls: self.backend_tls.clone(),
        }
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
            let conn = self.connection(stream, peer_addr.to_string());
            let connection_id = conn.connection_id();
            info!(connection_id, peer = %peer_addr, "New connection");

            tokio::spawn(async move {
                if let Err(e) = conn.run().await {
                    warn!(connection_id, error = %e, "Connection ended with error");
                } else {
                    info!(connection_id, "Connection ended");
                }
            });
        }
    }
}

/// Session loop of one client
pub struct ClientConnection {
    client: PacketIo,
    manager: Arc<BackendConnManager>,
    router: Arc<dyn Router>,
    frontend_tls: Option<Arc<rustls::ServerConfig>>,
    backend_tls: Option<Arc<rustls::ClientConfig>>,
}

impl ClientConnection {
    pub fn connection_id(&self) -> u64 {
        self.manager.connection_id()
    }

    pub fn manager(&self) -> Arc<BackendConnManager> {
        self.manager.clone()
    }

    /// Route, authenticate, then serve commands until the client leaves
    #[instrument(skip(self), fields(connection_id = self.manager.connection_id(), peer = %self.client.peer_addr()))]
    pub async fn run(mut self) -> Result<()> {
        let addr = match self.router.route(self.manager.clone()) {
            Ok(addr) => addr,
            Err(e) => {
                let err = ErrPacket::new(1105, "HY000", &e.to_string());
                self.client.reset_sequence();
                if self.client.write_packet(err.encode(CLIENT_PROTOCOL_41)).await.is_ok() {
                    let _ = self.client.flush().await;
                }
                self.manager.close().await?;
                return Err(e.into());
            }
        };

        self.manager
            .connect(&addr, &mut self.client, self.frontend_tls.clone(), self.backend_tls.clone())
            .await?;

        loop {
            self.client.reset_sequence();
            let request = match self.client.read_packet().await {
                Ok(request) => request,
                Err(e) if e.is_disconnect() => {
                    debug!("Client disconnected");
                    break;
                }
                Err(e) => {
                    self.manager.close().await?;
                    return Err(e);
                }
            };

            if request.first() == Some(&(Command::Quit as u8)) {
                break;
            }

            match self.manager.execute_cmd(request, &mut self.client).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    self.manager.close().await?;
                    return Err(e);
                }
                Err(e) => debug!(error = %e, "Command failed"),
            }
        }

        self.manager.close().await?;
        if let Err(e) = self.client.close().await {
            debug!(error = %e, "Failed to close client stream");
        }
        Ok(())
    }
}
