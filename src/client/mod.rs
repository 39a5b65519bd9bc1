//! Relay client: configuration and the connection manager.

#[allow(clippy::module_inception)]
mod client;
mod config;

pub use client::*;
pub use config::*;
