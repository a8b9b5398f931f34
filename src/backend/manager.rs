use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rustls::{ClientConfig, ServerConfig};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::authenticator::Authenticator;
use super::connector::{AddrProvider, BackendConnector};
use super::executor::CmdExecutor;
use super::session::Session;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::{capabilities::DEFAULT_CAPABILITIES, PacketIo};
use crate::router::{ConnEventReceiver, RedirectableConn};

/// Settings handed to every connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Capabilities offered to clients
    pub capability: u32,
    pub server_version: String,
    pub connect_timeout: Duration,
    /// Bound on connecting and re-authenticating during a redirect
    pub redirect_timeout: Duration,
    /// Fixed session token; derived per session when unset
    pub session_token: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for ManagerConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            capability: DEFAULT_CAPABILITIES,
            server_version: config.server_version.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            redirect_timeout: Duration::from_millis(config.redirect_timeout_ms),
            session_token: config.session_token.clone(),
        }
    }
}

/// Lifecycle state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Authenticated,
    Serving,
    Redirecting,
    Closed,
}

struct Inner {
    session: Session,
    executor: CmdExecutor,
    /// Current backend address; set once connecting starts
    addr: String,
    backend: Option<PacketIo>,
    backend_tls: Option<Arc<ClientConfig>>,
}

/// Owns the session of one client connection and its current backend link
pub struct BackendConnManager {
    connection_id: u64,
    config: ManagerConfig,
    authenticator: Authenticator,
    connector: Arc<dyn BackendConnector>,
    inner: tokio::sync::Mutex<Inner>,
    redirect_pending: watch::Sender<bool>,
    receiver: RwLock<Option<Arc<dyn ConnEventReceiver>>>,
    state: Mutex<ConnState>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl BackendConnManager {
    pub fn new(connection_id: u64, connector: Arc<dyn BackendConnector>, config: ManagerConfig) -> Self {
        let authenticator = Authenticator::new(
            config.capability,
            config.server_version.clone(),
            config.session_token.clone(),
        );
        let (redirect_pending, _) = watch::channel(false);

        Self {
            connection_id,
            authenticator,
            connector,
            inner: tokio::sync::Mutex::new(Inner {
                session: Session::new(connection_id),
                executor: CmdExecutor::default(),
                addr: String::new(),
                backend: None,
                backend_tls: None,
            }),
            redirect_pending,
            receiver: RwLock::new(None),
            state: Mutex::new(ConnState::Connecting),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn redirect_pending(&self) -> bool {
        *self.redirect_pending.borrow()
    }

    /// Address of the current backend
    pub async fn backend_addr(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.backend.as_ref().map(|_| inner.addr.clone())
    }

    /// Snapshot of the session
    pub async fn session(&self) -> Session {
        self.inner.lock().await.session.clone()
    }

    fn set_state(&self, state: ConnState) {
        let mut current = self.state.lock();
        if *current != ConnState::Closed {
            *current = state;
        }
    }

    /// Authenticate the client against the backend at `addr`
    #[instrument(skip_all, fields(connection_id = self.connection_id, addr = addr))]
    pub async fn connect(
        &self,
        addr: &str,
        client: &mut PacketIo,
        frontend_tls: Option<Arc<ServerConfig>>,
        backend_tls: Option<Arc<ClientConfig>>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed);
        }

        let mut guard = self.inner.lock().await;
        if self.state() != ConnState::Connecting {
            return Err(ProxyError::Protocol("connection is already established".into()));
        }
        guard.addr = addr.to_string();

        let provider = AddrProvider {
            connector: self.connector.as_ref(),
            addr,
            connect_timeout: self.config.connect_timeout,
        };
        let inner = &mut *guard;
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Closed),
            r = self.authenticator.handshake_first_time(
                &mut inner.session,
                client,
                &provider,
                frontend_tls,
                backend_tls.clone(),
            ) => r,
        };

        match result {
            Ok(backend) => {
                inner.backend = Some(backend);
                inner.backend_tls = backend_tls;
                inner.executor = CmdExecutor::new(inner.session.capability);
                self.set_state(ConnState::Authenticated);
                Ok(())
            }
            Err(e) => {
                drop(guard);
                warn!(error = %e, "Handshake failed");
                self.close().await?;
                Err(e)
            }
        }
    }

    /// Execute one client command, waiting out a pending redirect if needed
    pub async fn execute_cmd(&self, request: Bytes, client: &mut PacketIo) -> Result<()> {
        let mut wait_for_redirect = true;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ProxyError::Closed);
            }

            let mut guard = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ProxyError::Closed),
                g = self.inner.lock() => g,
            };
            let pending = self.redirect_pending();
            let inner = &mut *guard;
            let Some(backend) = inner.backend.as_mut() else {
                return Err(ProxyError::Closed);
            };
            if self.state() == ConnState::Authenticated {
                self.set_state(ConnState::Serving);
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ProxyError::Closed),
                r = inner.executor.execute_cmd(&request, client, backend, wait_for_redirect && pending) => r,
            };

            match result {
                Ok(true) => {
                    drop(guard);
                    self.wait_redirect_resolved().await?;
                    wait_for_redirect = false;
                }
                Ok(false) => {
                    inner.session.observe_command(&request);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    drop(guard);
                    debug!(connection_id = self.connection_id, error = %e, "Command failed fatally");
                    self.close().await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_redirect_resolved(&self) -> Result<()> {
        let mut pending = self.redirect_pending.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Closed),
            r = async { pending.wait_for(|p| !*p).await.map(|_| ()) } => {
                r.map_err(|_| ProxyError::Closed)
            }
        }
    }

    /// Move the session to the backend at `to` without the client noticing.
    ///
    /// Failure leaves the current backend in place; the outcome is reported to
    /// the event receiver either way, except for a rejected concurrent call.
    #[instrument(skip(self), fields(connection_id = self.connection_id))]
    pub async fn redirect(&self, to: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed);
        }

        let mut claimed = false;
        self.redirect_pending.send_if_modified(|pending| {
            if *pending {
                false
            } else {
                *pending = true;
                claimed = true;
                true
            }
        });
        if !claimed {
            return Err(ProxyError::RedirectBusy);
        }

        let (from, result) = self.try_redirect(to).await;
        self.redirect_pending.send_replace(false);

        let Some(from) = from else {
            return result;
        };
        let receiver = self.receiver.read().clone();
        match &result {
            Ok(()) => {
                info!(from = %from, to = to, "Redirect succeeded");
                if let Some(receiver) = receiver {
                    receiver.on_redirect_succeed(&from, to, self);
                }
            }
            Err(e) => {
                warn!(from = %from, to = to, error = %e, "Redirect failed");
                if let Some(receiver) = receiver {
                    receiver.on_redirect_fail(&from, to, self);
                }
            }
        }
        result
    }

    /// Returns the address the session was on, if it had a backend
    async fn try_redirect(&self, to: &str) -> (Option<String>, Result<()>) {
        let mut guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return (None, Err(ProxyError::Closed)),
            g = self.inner.lock() => g,
        };
        if guard.backend.is_none() || self.closed.load(Ordering::Acquire) {
            return (None, Err(ProxyError::Closed));
        }
        let from = guard.addr.clone();

        if let Some(reason) = guard.executor.redirect_blocker() {
            return (Some(from), Err(ProxyError::NotRedirectable(reason)));
        }
        let Some(token) = guard.session.token().map(str::to_string) else {
            return (Some(from), Err(ProxyError::Auth("session has no token".into())));
        };

        self.set_state(ConnState::Redirecting);
        // The attempt must not borrow through the guard: `Inner` is not `Sync`
        let session = guard.session.clone();
        let backend_tls = guard.backend_tls.clone();
        let attempt = async {
            let mut backend = self.connector.connect(to).await?;
            self.authenticator
                .handshake_second_time(&session, None, &mut backend, backend_tls, &token)
                .await?;
            Ok::<_, ProxyError>(backend)
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Closed),
            r = timeout(self.config.redirect_timeout, attempt) => match r {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("redirect to {to} timed out"),
                ).into()),
            },
        };

        match result {
            Ok(backend) => {
                let old = guard.backend.replace(backend);
                guard.addr = to.to_string();
                let capability = guard.session.capability;
                guard.executor.set_capability(capability);
                self.set_state(ConnState::Serving);
                drop(guard);

                if let Some(mut old) = old {
                    if let Err(e) = old.close().await {
                        debug!(addr = %from, error = %e, "Failed to close previous backend");
                    }
                }
                (Some(from), Ok(()))
            }
            Err(e) => {
                self.set_state(ConnState::Serving);
                (Some(from), Err(e))
            }
        }
    }

    /// Close the connection; later calls are no-ops
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        *self.state.lock() = ConnState::Closed;

        let mut guard = self.inner.lock().await;
        let addr = guard.addr.clone();
        let backend = guard.backend.take();
        drop(guard);

        if let Some(mut backend) = backend {
            if let Err(e) = backend.close().await {
                debug!(connection_id = self.connection_id, error = %e, "Failed to close backend");
            }
        }

        info!(connection_id = self.connection_id, addr = %addr, "Connection closed");
        let receiver = self.receiver.read().clone();
        if let Some(receiver) = receiver {
            receiver.on_conn_closed(&addr, self);
        }
        Ok(())
    }
}

impl RedirectableConn for BackendConnManager {
    fn set_event_receiver(&self, receiver: Arc<dyn ConnEventReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    fn redirect(&self, addr: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { BackendConnManager::redirect(self, &addr).await })
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}
