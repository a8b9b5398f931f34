use std::io;

use thiserror::Error;

use crate::protocol::ErrPacket;
use crate::router::RouterError;

/// Errors surfaced by the connection lifecycle and redirection engine
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Backend-reported error, already relayed to the client
    #[error("backend error {} ({}): {}", .0.error_code, .0.sql_state, .0.error_message)]
    Execution(ErrPacket),
    #[error("a redirect is already in progress")]
    RedirectBusy,
    #[error("connection cannot be redirected: {0}")]
    NotRedirectable(&'static str),
    #[error("connection is closed")]
    Closed,
    #[error("routing failed: {0}")]
    Route(#[from] RouterError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether the error leaves the client connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Io(_) | ProxyError::Protocol(_) | ProxyError::Closed)
    }

    /// Whether the error is the peer going away
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
