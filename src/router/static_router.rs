use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{ConnEventReceiver, RedirectableConn, Router, RouterError};

struct ConnEntry {
    conn: Arc<dyn RedirectableConn>,
    addr: String,
}

/// Routes to a fixed backend list by least connections
///
/// Connections on a backend that was removed with [`StaticRouter::set_backends`]
/// are moved by [`Router::redirect_connections`].
pub struct StaticRouter {
    backends: RwLock<Vec<String>>,
    conns: DashMap<u64, ConnEntry>,
    closed: AtomicBool,
    self_ref: Weak<StaticRouter>,
}

impl StaticRouter {
    pub fn new(backends: Vec<String>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            backends: RwLock::new(backends),
            conns: DashMap::new(),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Replace the backend list; existing connections stay until redirected.
    ///
    /// To drain a backend, remove it here and then call
    /// [`Router::redirect_connections`]. The `ferry` binary does both when it
    /// receives SIGHUP, reloading the list from its configuration file.
    pub fn set_backends(&self, backends: Vec<String>) {
        info!(backends = ?backends, "Backend list updated");
        *self.backends.write() = backends;
    }

    pub fn backends(&self) -> Vec<String> {
        self.backends.read().clone()
    }

    /// Number of tracked connections on `addr`
    pub fn connection_count(&self, addr: &str) -> usize {
        self.conns.iter().filter(|entry| entry.addr == addr).count()
    }

    /// Backend a tracked connection is on
    pub fn backend_of(&self, connection_id: u64) -> Option<String> {
        self.conns.get(&connection_id).map(|entry| entry.addr.clone())
    }

    fn load(&self) -> HashMap<String, usize> {
        let mut load = HashMap::new();
        for entry in self.conns.iter() {
            *load.entry(entry.addr.clone()).or_insert(0) += 1;
        }
        load
    }

    fn least_loaded(backends: &[String], load: &HashMap<String, usize>) -> Option<String> {
        backends
            .iter()
            .min_by_key(|addr| load.get(*addr).copied().unwrap_or(0))
            .cloned()
    }
}

impl Router for StaticRouter {
    fn route(&self, conn: Arc<dyn RedirectableConn>) -> Result<String, RouterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }

        let backends = self.backends.read().clone();
        let addr = Self::least_loaded(&backends, &self.load()).ok_or(RouterError::NoBackend)?;

        if let Some(receiver) = self.self_ref.upgrade() {
            conn.set_event_receiver(receiver);
        }
        debug!(connection_id = conn.connection_id(), addr = %addr, "Routed connection");
        self.conns.insert(
            conn.connection_id(),
            ConnEntry {
                conn,
                addr: addr.clone(),
            },
        );
        Ok(addr)
    }

    fn redirect_connections(&self) -> Result<(), RouterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }

        let backends = self.backends.read().clone();
        let mut load = self.load();
        let stranded: Vec<(Arc<dyn RedirectableConn>, String)> = self
            .conns
            .iter()
            .filter(|entry| !backends.contains(&entry.addr))
            .map(|entry| (entry.conn.clone(), entry.addr.clone()))
            .collect();

        for (conn, from) in stranded {
            let to = Self::least_loaded(&backends, &load).ok_or(RouterError::NoBackend)?;
            *load.entry(to.clone()).or_insert(0) += 1;
            if let Some(count) = load.get_mut(&from) {
                *count = count.saturating_sub(1);
            }

            tokio::spawn(async move {
                let connection_id = conn.connection_id();
                if let Err(e) = conn.redirect(to.clone()).await {
                    debug!(connection_id, to = %to, error = %e, "Redirect not completed");
                }
            });
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(connections = self.conns.len(), "Router closed");
            self.conns.clear();
        }
    }
}

impl ConnEventReceiver for StaticRouter {
    fn on_redirect_succeed(&self, from: &str, to: &str, conn: &dyn RedirectableConn) {
        if let Some(mut entry) = self.conns.get_mut(&conn.connection_id()) {
            entry.addr = to.to_string();
        }
        info!(connection_id = conn.connection_id(), from = from, to = to, "Connection redirected");
    }

    fn on_redirect_fail(&self, from: &str, to: &str, conn: &dyn RedirectableConn) {
        warn!(connection_id = conn.connection_id(), from = from, to = to, "Connection redirect failed");
    }

    fn on_conn_closed(&self, addr: &str, conn: &dyn RedirectableConn) {
        self.conns.remove(&conn.connection_id());
        debug!(connection_id = conn.connection_id(), addr = addr, "Connection released");
    }
}
