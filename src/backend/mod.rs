//! Connection lifecycle and redirection engine.
//!
//! [`BackendConnManager`] owns the [`Session`] of one client connection and
//! serializes command execution against redirects to another backend.

mod authenticator;
mod connector;
mod executor;
mod manager;
mod session;

pub use authenticator::{Authenticator, SESSION_TOKEN_AUTH_PLUGIN, UNKNOWN_AUTH_PLUGIN};
pub use connector::{BackendChannelProvider, BackendConnector, TcpConnector};
pub use executor::CmdExecutor;
pub use manager::{BackendConnManager, ConnState, ManagerConfig};
pub use session::{Session, SALT_LEN};
