//! Redirect-control contracts between connections and the router
//!
//! A router only ever sees a connection through [`RedirectableConn`] and is
//! told about outcomes through [`ConnEventReceiver`].

mod static_router;

pub use static_router::StaticRouter;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::error::Result;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no backend available")]
    NoBackend,
    #[error("router is closed")]
    Closed,
}

/// The part of a connection a router may drive
pub trait RedirectableConn: Send + Sync {
    /// Register the receiver of redirect and close events; the last call wins
    fn set_event_receiver(&self, receiver: Arc<dyn ConnEventReceiver>);
    /// Move the connection to the backend at `addr`
    fn redirect(&self, addr: String) -> BoxFuture<'_, Result<()>>;
    fn connection_id(&self) -> u64;
}

/// Notified by connections about redirect outcomes and closure
pub trait ConnEventReceiver: Send + Sync {
    fn on_redirect_succeed(&self, from: &str, to: &str, conn: &dyn RedirectableConn);
    fn on_redirect_fail(&self, from: &str, to: &str, conn: &dyn RedirectableConn);
    fn on_conn_closed(&self, addr: &str, conn: &dyn RedirectableConn);
}

/// Decides where connections go and when they move
pub trait Router: Send + Sync {
    /// Pick the backend for a new connection and start tracking it
    fn route(&self, conn: Arc<dyn RedirectableConn>) -> std::result::Result<String, RouterError>;
    /// Start moving every connection that should be elsewhere
    fn redirect_connections(&self) -> std::result::Result<(), RouterError>;
    fn close(&self);
}
