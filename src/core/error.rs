//! Error types for the relay client.

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Boxed error produced by a relay session collaborator.
pub type SessionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while negotiating the HTTP upgrade.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Writing the request, flushing it, or reading the response failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The response head could not be parsed.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The response head exceeded the size limit.
    #[error("response head exceeds {limit} bytes")]
    HeadTooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// The server answered with something other than 101 Switching Protocols.
    #[error("GET failed: {status}: {body}")]
    Rejected {
        /// Status returned by the server.
        status: StatusCode,
        /// Response body, lossily decoded and bounded.
        body: String,
    },
}

impl From<httparse::Error> for HandshakeError {
    fn from(err: httparse::Error) -> Self {
        HandshakeError::Malformed(err.to_string())
    }
}

/// Errors surfaced by [`Client`](crate::client::Client).
///
/// Connection-time variants carry `op`, the name of the operation that
/// triggered the (possibly implicit) connect.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A configured request header value is not a valid header value.
    #[error("invalid {header} header: {reason}")]
    InvalidConfig {
        /// Header the value was configured for.
        header: &'static str,
        /// Why the value was refused.
        reason: String,
    },

    /// Opening the TCP stream or the TLS session failed.
    #[error("{op} connect: {source}")]
    Dial {
        /// Calling operation.
        op: &'static str,
        /// Underlying network error.
        #[source]
        source: io::Error,
    },

    /// The upgrade exchange failed before a status could be judged.
    #[error("{op} connect: {source}")]
    Handshake {
        /// Calling operation.
        op: &'static str,
        /// Handshake failure.
        #[source]
        source: HandshakeError,
    },

    /// The server refused to switch protocols.
    #[error("{op} connect: GET failed: {status}: {body}")]
    UpgradeRejected {
        /// Calling operation.
        op: &'static str,
        /// Status returned instead of 101.
        status: StatusCode,
        /// Response body for diagnostics.
        body: String,
    },

    /// The relay session could not be started over the upgraded stream.
    #[error("{op} connect: session setup: {source}")]
    SessionSetup {
        /// Calling operation.
        op: &'static str,
        /// Error from the session factory.
        #[source]
        source: SessionError,
    },

    /// A send or receive on the active session failed.
    #[error(transparent)]
    Session(SessionError),

    /// The client has been closed.
    #[error("relay client closed")]
    Closed,

    /// The caller's cancellation signal fired during connect.
    #[error("{op} connect: cancelled")]
    Cancelled {
        /// Calling operation.
        op: &'static str,
    },

    /// Connect did not finish within the configured timeout.
    #[error("{op} connect: timed out")]
    Timeout {
        /// Calling operation.
        op: &'static str,
    },
}

impl ClientError {
    pub(crate) fn from_handshake(op: &'static str, err: HandshakeError) -> Self {
        match err {
            HandshakeError::Rejected { status, body } => {
                ClientError::UpgradeRejected { op, status, body }
            }
            source => ClientError::Handshake { op, source },
        }
    }

    /// Returns `true` for [`ClientError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, ClientError::Closed)
    }
}
