//! Client session loop and listener

mod client;

pub use client::{ClientConnection, Driver};
