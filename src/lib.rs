//! # relaytun
//!
//! A resilient client for a message-relay protocol tunneled through an
//! HTTP/1.1 connection upgrade. To middleboxes, including TLS-intercepting
//! proxies, the tunnel looks like an ordinary WebSocket:
//!
//! ```text
//! GET /derp HTTP/1.1
//! Host: relay.example
//! Upgrade: WebSocket
//! Connection: Upgrade
//!
//! HTTP/1.1 101 Switching Protocols
//! ```
//!
//! After the `101`, the stream belongs to the relay protocol, which this
//! crate treats as a pluggable [`SessionFactory`]/[`RelaySession`] pair.
//!
//! ## Connection contract
//!
//! - Connections are made lazily, at most one at a time per [`Client`].
//! - A failed send or receive returns its error and is **not** retried,
//!   but the connection is torn down so the next call reconnects.
//! - [`Client::close`] is terminal; every later call fails with
//!   [`ClientError::Closed`], including a second `close`.
//!
//! ## Feature Flags
//!
//! - `tls` (default): `https` endpoints via rustls and the platform verifier.
//!
//! ## Modules
//!
//! - [`core`]: Errors, constants, logging sink, session traits
//! - [`crypto`]: Identity and destination keys
//! - [`transport`]: Endpoint parsing, dialing, upgrade handshake
//! - [`client`]: The connection manager

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod core;
pub mod crypto;
pub mod transport;

#[cfg(test)]
mod test_support;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder, ClientConfig, ClientState};
    pub use crate::core::{ClientError, HandshakeError, Logf, RelaySession, SessionError, SessionFactory};
    pub use crate::crypto::{PrivateKey, PublicKey};
    pub use crate::transport::{Conn, Endpoint, Scheme, UpgradeResponse};
}

// Re-export commonly used items at crate root
pub use crate::client::{Client, ClientBuilder, ClientConfig, ClientState};
pub use crate::core::{ClientError, HandshakeError, Logf, RelaySession, SessionError, SessionFactory};
pub use crate::crypto::{PrivateKey, PublicKey};
pub use crate::transport::{Conn, Endpoint, MaybeTlsStream, Scheme};
