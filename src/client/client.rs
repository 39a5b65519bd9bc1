//! Relay-over-HTTP connection manager.
//!
//! [`Client`] connects lazily and reconnects on demand. A failed
//! [`send`](Client::send) or [`recv`](Client::recv) reports its error and
//! does not retry, but it tears the connection down so the next call dials
//! a completely fresh one. [`close`](Client::close) is terminal.
//!
//! Two locks guard the shared state:
//!
//! - the session lock (async) owns the [`State`] and is held for a whole
//!   connection attempt, so concurrent callers never dial twice;
//! - the transport lock (sync, never held across an await) owns the
//!   [`Link`] of the connection being dialed or in use, so `close` can
//!   abort a blocked dial without waiting for the session lock.

use std::future;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::io::BufStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::ClientConfig;
use crate::core::{ClientError, Logf, RelaySession, SessionFactory};
use crate::crypto::{PrivateKey, PublicKey};
use crate::transport::{Dialer, Endpoint, UpgradeRequest, UpgradeResponse, upgrade};

const OP_CONNECT: &str = "Client::connect";
const OP_SEND: &str = "Client::send";
const OP_RECV: &str = "Client::recv";

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection; the next operation dials.
    Disconnected,
    /// Dial or handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Closed for good.
    Closed,
}

/// Session-level state, guarded by the session lock.
enum State<S> {
    Disconnected,
    Connected(Active<S>),
    Closed,
}

/// The live connection: session, transport link and handshake metadata
/// always travel together.
struct Active<S> {
    generation: u64,
    session: Arc<S>,
    link: CancellationToken,
    response: UpgradeResponse,
}

impl<S> Active<S> {
    fn handle(&self) -> Handle<S> {
        Handle {
            generation: self.generation,
            session: Arc::clone(&self.session),
            link: self.link.clone(),
        }
    }
}

/// What send/recv need from the active connection, usable outside the lock.
struct Handle<S> {
    generation: u64,
    session: Arc<S>,
    link: CancellationToken,
}

/// Raw transport handle, guarded by the transport lock.
///
/// Cancelling the token closes the transport: it aborts an in-flight dial
/// and any delegated send/recv running on that connection.
enum Link {
    Idle,
    Dialing {
        generation: u64,
        token: CancellationToken,
    },
    Open {
        generation: u64,
        token: CancellationToken,
    },
}

/// A relay-over-HTTP client.
///
/// Share it behind an [`Arc`]; every method takes `&self`.
///
/// # Example
///
/// ```ignore
/// use relaytun::prelude::*;
///
/// let client = Client::new(PrivateKey::generate(), "https://relay.example/derp", Logf::tracing(), factory)?;
/// client.send(&peer, b"hello").await?;
/// let msg = client.recv(&mut buf).await?;
/// client.close().await?;
/// ```
pub struct Client<F: SessionFactory> {
    key: PrivateKey,
    logf: Logf,
    endpoint: Endpoint,
    config: ClientConfig,
    request: UpgradeRequest,
    factory: F,
    dialer: Dialer,

    /// One-shot; set by the first `close`.
    closed: AtomicBool,
    generation: AtomicU64,

    link: StdMutex<Link>,
    state: Mutex<State<F::Session>>,
}

impl<F: SessionFactory> Client<F> {
    /// Create a client for `server_url`. It connects lazily; use
    /// [`connect`](Self::connect) to connect eagerly.
    pub fn new(
        key: PrivateKey,
        server_url: &str,
        logf: Logf,
        factory: F,
    ) -> Result<Self, ClientError> {
        Self::with_config(key, server_url, logf, factory, ClientConfig::default())
    }

    /// Create a client with explicit configuration.
    pub fn with_config(
        key: PrivateKey,
        server_url: &str,
        logf: Logf,
        factory: F,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let endpoint = Endpoint::parse(server_url)?;
        let request = UpgradeRequest::new(&endpoint, &config.upgrade_token)
            .map_err(|e| ClientError::InvalidConfig {
                header: "Upgrade",
                reason: e.to_string(),
            })?
            .with_user_agent(config.user_agent.as_deref())
            .map_err(|e| ClientError::InvalidConfig {
                header: "User-Agent",
                reason: e.to_string(),
            })?;
        let dialer = Dialer::from_config(&config);

        Ok(Self {
            key,
            logf,
            endpoint,
            config,
            request,
            factory,
            dialer,
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            link: StdMutex::new(Link::Idle),
            state: Mutex::new(State::Disconnected),
        })
    }

    /// Connect unless already connected.
    ///
    /// Returns `Ok` without any I/O when a good connection exists.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.ensure_connected(OP_CONNECT, None).await.map(drop)
    }

    /// Like [`connect`](Self::connect), abandoning the attempt with
    /// [`ClientError::Cancelled`] once `cancel` fires.
    ///
    /// Cancellation is checked while waiting for a concurrent attempt,
    /// during the dial and handshake, and once more before the new session
    /// is installed.
    pub async fn connect_cancellable(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        self.ensure_connected(OP_CONNECT, Some(cancel)).await.map(drop)
    }

    /// Send `payload` to `dst`, connecting first if needed.
    ///
    /// On failure the connection is torn down (the next call reconnects)
    /// and the error is returned as is. The send is never retried.
    pub async fn send(&self, dst: &PublicKey, payload: &[u8]) -> Result<(), ClientError> {
        let handle = self.ensure_connected(OP_SEND, None).await?;

        let result = tokio::select! {
            biased;
            _ = handle.link.cancelled() => Err(self.interrupted()),
            sent = handle.session.send(dst, payload) => sent.map_err(ClientError::Session),
        };
        if let Err(error) = &result {
            self.teardown(handle.generation, OP_SEND, error).await;
        }
        result
    }

    /// Receive the next message, connecting first if needed.
    ///
    /// Failure semantics match [`send`](Self::send).
    pub async fn recv(
        &self,
        buf: &mut [u8],
    ) -> Result<<F::Session as RelaySession>::Message, ClientError> {
        let handle = self.ensure_connected(OP_RECV, None).await?;

        let result = tokio::select! {
            biased;
            _ = handle.link.cancelled() => Err(self.interrupted()),
            msg = handle.session.recv(buf) => msg.map_err(ClientError::Session),
        };
        if let Err(error) = &result {
            self.teardown(handle.generation, OP_RECV, error).await;
        }
        result
    }

    /// Close the client. It never reconnects afterwards.
    ///
    /// Closing twice is an error: the second call returns
    /// [`ClientError::Closed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::Closed);
        }
        self.logf.log("Client::close: closing");

        // Abort a dial in progress before queueing for the session lock.
        if let Some(token) = self.take_link(None) {
            token.cancel();
        }

        let mut state = self.state.lock().await;
        if let State::Connected(active) = mem::replace(&mut *state, State::Closed) {
            active.link.cancel();
            debug!(generation = active.generation, "dropped active connection on close");
        }
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        if self.closed.load(Ordering::Acquire) {
            return ClientState::Closed;
        }
        match &*self.lock_link() {
            Link::Idle => ClientState::Disconnected,
            Link::Dialing { .. } => ClientState::Connecting,
            Link::Open { .. } => ClientState::Connected,
        }
    }

    /// Check if a session is currently established.
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Upgrade response of the current connection, if any.
    pub async fn handshake_response(&self) -> Option<UpgradeResponse> {
        match &*self.state.lock().await {
            State::Connected(active) => Some(active.response.clone()),
            _ => None,
        }
    }

    /// Relay server endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Public half of the client's identity.
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    /// Return the active session, dialing a new one if there is none.
    async fn ensure_connected(
        &self,
        op: &'static str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Handle<F::Session>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }

        let mut state = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(ClientError::Cancelled { op }),
            guard = self.state.lock() => guard,
        };

        match &*state {
            State::Closed => return Err(ClientError::Closed),
            State::Connected(active) if !active.link.is_cancelled() => {
                return Ok(active.handle());
            }
            _ => {}
        }
        // Also drops a connection whose transport closed before its
        // teardown ran.
        *state = State::Disconnected;

        self.logf.log(&format!("{op}: connecting"));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        {
            let mut link = self.lock_link();
            // Checked under the transport lock: either close() sees this
            // attempt's link or this attempt sees close().
            if self.closed.load(Ordering::Acquire) {
                return Err(ClientError::Closed);
            }
            *link = Link::Dialing {
                generation,
                token: token.clone(),
            };
        }
        let attempt = Attempt {
            client: self,
            generation,
            armed: true,
        };

        let established = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClientError::Closed),
            _ = cancelled(cancel) => Err(ClientError::Cancelled { op }),
            result = tokio::time::timeout(self.config.connect_timeout, self.establish(op)) => {
                result.unwrap_or_else(|_| Err(ClientError::Timeout { op }))
            }
        };
        let (session, response) = established.inspect_err(|error| {
            debug!(op, generation, %error, "connect failed");
        })?;

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(ClientError::Cancelled { op });
        }
        {
            let mut link = self.lock_link();
            if token.is_cancelled() || self.closed.load(Ordering::Acquire) {
                return Err(ClientError::Closed);
            }
            *link = Link::Open {
                generation,
                token: token.clone(),
            };
        }
        attempt.disarm();

        let active = Active {
            generation,
            session: Arc::new(session),
            link: token,
            response,
        };
        let handle = active.handle();
        *state = State::Connected(active);
        self.logf.log(&format!("{op}: connected to {}", self.endpoint));
        Ok(handle)
    }

    /// Dial, upgrade, and start the relay session. Whatever was opened is
    /// dropped, and thereby closed, when a later step fails.
    async fn establish(
        &self,
        op: &'static str,
    ) -> Result<(F::Session, UpgradeResponse), ClientError> {
        let stream = self
            .dialer
            .dial(&self.endpoint)
            .await
            .map_err(|source| ClientError::Dial { op, source })?;
        debug!(
            op,
            peer = ?stream.peer_addr().ok(),
            encrypted = stream.is_encrypted(),
            "transport open"
        );

        let mut conn = BufStream::new(stream);
        let response = upgrade(&mut conn, &self.request)
            .await
            .map_err(|e| ClientError::from_handshake(op, e))?;

        let session = self
            .factory
            .establish(&self.key, conn, &self.logf)
            .await
            .map_err(|source| ClientError::SessionSetup { op, source })?;
        Ok((session, response))
    }

    /// Drop connection `generation` after an I/O failure. A connection
    /// that has already been replaced is left alone.
    async fn teardown(&self, generation: u64, op: &'static str, error: &ClientError) {
        // Close the transport first so other operations blocked on it
        // unwind instead of holding us up.
        if let Some(token) = self.take_link(Some(generation)) {
            token.cancel();
        }

        let mut state = self.state.lock().await;
        if matches!(&*state, State::Connected(active) if active.generation == generation) {
            *state = State::Disconnected;
            warn!(op, generation, %error, "relay connection lost");
            self.logf.log(&format!("{op}: {error}; will reconnect"));
        }
    }

    /// Error for an operation whose connection was closed underneath it.
    fn interrupted(&self) -> ClientError {
        if self.closed.load(Ordering::Acquire) {
            ClientError::Closed
        } else {
            ClientError::Session(Box::new(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "relay connection torn down",
            )))
        }
    }

    /// Clear the link if it belongs to `generation` (any, when `None`) and
    /// return its token.
    fn take_link(&self, generation: Option<u64>) -> Option<CancellationToken> {
        let mut link = self.lock_link();
        let owned = match &*link {
            Link::Idle => false,
            Link::Dialing { generation: g, .. } | Link::Open { generation: g, .. } => {
                generation.is_none_or(|want| want == *g)
            }
        };
        if !owned {
            return None;
        }
        match mem::replace(&mut *link, Link::Idle) {
            Link::Dialing { token, .. } | Link::Open { token, .. } => Some(token),
            Link::Idle => None,
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F: SessionFactory> std::fmt::Debug for Client<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint.to_string())
            .field("public_key", &self.key.public_key())
            .field("state", &self.state())
            .finish()
    }
}

/// Resets a `Dialing` link when a connection attempt ends without a
/// session, including when the caller drops the future.
struct Attempt<'a, F: SessionFactory> {
    client: &'a Client<F>,
    generation: u64,
    armed: bool,
}

impl<F: SessionFactory> Attempt<'_, F> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: SessionFactory> Drop for Attempt<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut link = self.client.lock_link();
        if matches!(&*link, Link::Dialing { generation, .. } if *generation == self.generation) {
            *link = Link::Idle;
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => future::pending().await,
    }
}
