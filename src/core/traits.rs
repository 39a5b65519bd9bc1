//! Seams to the relay protocol that runs over the upgraded stream.
//!
//! The client never interprets relay frames. It hands the upgraded
//! connection to a [`SessionFactory`] and delegates data transfer to the
//! resulting [`RelaySession`].

use async_trait::async_trait;

use super::error::SessionError;
use super::logger::Logf;
use crate::crypto::{PrivateKey, PublicKey};
use crate::transport::Conn;

/// An established relay protocol session bound to one upgraded connection.
///
/// Methods take `&self`: the session owns whatever internal locking its
/// framing needs, so the client never serializes concurrent send and recv.
/// Once any method fails the session is considered dead.
#[async_trait]
pub trait RelaySession: Send + Sync + 'static {
    /// Message produced by [`recv`](Self::recv).
    type Message: Send;

    /// Send `payload` to the peer identified by `dst`.
    async fn send(&self, dst: &PublicKey, payload: &[u8]) -> Result<(), SessionError>;

    /// Receive the next message, using `buf` as scratch space.
    async fn recv(&self, buf: &mut [u8]) -> Result<Self::Message, SessionError>;
}

/// Builds a [`RelaySession`] over a freshly upgraded connection.
///
/// `conn` is both the raw transport and its buffered duplex: bytes the
/// server sent right after the 101 response are still in its read buffer.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// Session type produced.
    type Session: RelaySession;

    /// Run whatever greeting the relay protocol needs and return the session.
    async fn establish(
        &self,
        key: &PrivateKey,
        conn: Conn,
        logf: &Logf,
    ) -> Result<Self::Session, SessionError>;
}
