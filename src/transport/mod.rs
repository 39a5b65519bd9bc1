//! Transport layer: endpoint parsing, dialing, and the upgrade handshake.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Relay Session (external)       │
//! ├─────────────────────────────────────────┤
//! │   Upgrade Handshake (GET → 101)         │  ← handshake
//! ├─────────────────────────────────────────┤
//! │   TLS (https only)                      │  ← dial
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod dial;
mod endpoint;
mod handshake;

pub use dial::MaybeTlsStream;
pub(crate) use dial::Dialer;
pub use endpoint::{Endpoint, Scheme};
pub use handshake::{UpgradeRequest, UpgradeResponse, upgrade};

/// The upgraded connection handed to a relay session: raw transport and
/// buffered duplex in one value.
pub type Conn = tokio::io::BufStream<MaybeTlsStream>;
