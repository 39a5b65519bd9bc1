//! Wire and tuning constants for the relay-over-HTTP client.
//!
//! The handshake values are what intermediaries see on the wire; changing
//! them changes how the tunnel is disguised.

use std::time::Duration;

// =============================================================================
// KEYS
// =============================================================================

/// Curve25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Curve25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

// =============================================================================
// UPGRADE HANDSHAKE
// =============================================================================

/// Default `Upgrade:` header value. Makes the tunnel look like a WebSocket.
pub const DEFAULT_UPGRADE_TOKEN: &str = "WebSocket";

/// `Connection:` header value requesting the protocol switch.
pub const CONNECTION_UPGRADE: &str = "Upgrade";

/// Maximum size of the upgrade response head (status line + headers).
pub const MAX_RESPONSE_HEAD_SIZE: usize = 16 * 1024;

/// Maximum number of response headers parsed.
pub const MAX_RESPONSE_HEADERS: usize = 64;

/// Maximum number of body bytes kept from a rejected upgrade.
pub const MAX_REJECTION_BODY_SIZE: usize = 64 * 1024;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Port used for encrypted endpoints that do not name one.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Default bound on dial + TLS + upgrade + session setup.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
