//! MySQL protocol proxy whose client sessions can be moved between backend
//! servers without the client reconnecting.

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod router;

pub use error::{ProxyError, Result};
