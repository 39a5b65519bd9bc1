//! Loopback relay server and a length-prefixed echo session for tests.
//!
//! Frame format, both directions: `u32` big-endian length, then the body.
//! Client frames carry a 32-byte destination key before the payload; the
//! server echoes the payload alone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tls")]
use {
    rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    tokio_rustls::{TlsAcceptor, rustls},
};

use crate::core::{Logf, PUBLIC_KEY_SIZE, RelaySession, SessionError, SessionFactory};
use crate::crypto::{PrivateKey, PublicKey};
use crate::transport::Conn;

/// Bytes the relay sends right after the 101 head.
pub(crate) const GREETING: &[u8; 4] = b"RLY1";

/// Self-signed certificate for `127.0.0.1` and `localhost`.
#[cfg(feature = "tls")]
pub(crate) fn test_certificate() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_owned(), "localhost".to_owned()])
            .unwrap();
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    (cert.der().clone(), key.into())
}

#[cfg(feature = "tls")]
fn ring_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(feature = "tls")]
pub(crate) fn server_tls_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> Arc<rustls::ServerConfig> {
    let config = rustls::ServerConfig::builder_with_provider(ring_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    Arc::new(config)
}

/// Client configuration trusting only `trusted`.
#[cfg(feature = "tls")]
pub(crate) fn client_tls_config(trusted: CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(trusted).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(ring_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// How the relay answers an upgrade request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// 101, greeting, then echo frames.
    Switch,
    /// Plain HTTP response with the given status and body, then close.
    Status(u16, String),
    /// Read the request and never answer.
    Hang,
}

struct Shared {
    accepted: AtomicUsize,
    handshakes: AtomicUsize,
    reply: StdMutex<Reply>,
    greeting: StdMutex<&'static [u8]>,
    hello: StdMutex<Option<Vec<u8>>>,
    kill: StdMutex<CancellationToken>,
}

/// Transport the relay accepts connections over.
#[derive(Clone)]
enum Security {
    Plain,
    #[cfg(feature = "tls")]
    Tls(TlsAcceptor),
}

pub(crate) struct TestRelay {
    addr: SocketAddr,
    scheme: &'static str,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl TestRelay {
    pub(crate) async fn start() -> Self {
        Self::spawn(Security::Plain).await
    }

    /// Relay behind TLS, plus a client configuration that trusts it.
    #[cfg(feature = "tls")]
    pub(crate) async fn start_tls() -> (Self, Arc<rustls::ClientConfig>) {
        let (cert, key) = test_certificate();
        let acceptor = TlsAcceptor::from(server_tls_config(cert.clone(), key));
        let relay = Self::spawn(Security::Tls(acceptor)).await;
        (relay, client_tls_config(cert))
    }

    async fn spawn(security: Security) -> Self {
        let scheme = match &security {
            Security::Plain => "http",
            #[cfg(feature = "tls")]
            Security::Tls(_) => "https",
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            accepted: AtomicUsize::new(0),
            handshakes: AtomicUsize::new(0),
            reply: StdMutex::new(Reply::Switch),
            greeting: StdMutex::new(GREETING),
            hello: StdMutex::new(None),
            kill: StdMutex::new(CancellationToken::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accept_shared);
                let kill = shared.kill.lock().unwrap().clone();
                let security = security.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = kill.cancelled() => {}
                        _ = accept(sock, security, &shared) => {}
                    }
                });
            }
        });

        Self {
            addr,
            scheme,
            shared,
            task,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("{}://{}/derp", self.scheme, self.addr)
    }

    pub(crate) fn set_reply(&self, reply: Reply) {
        *self.shared.reply.lock().unwrap() = reply;
    }

    pub(crate) fn set_greeting(&self, greeting: &'static [u8]) {
        *self.shared.greeting.lock().unwrap() = greeting;
    }

    /// Frame pushed to the client after the greeting on every connection.
    pub(crate) fn set_hello(&self, hello: Option<Vec<u8>>) {
        *self.shared.hello.lock().unwrap() = hello;
    }

    pub(crate) fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_handshakes(&self, n: usize) {
        while self.handshakes() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drop every open connection. Later connections are unaffected.
    pub(crate) fn break_connections(&self) {
        let old = std::mem::replace(&mut *self.shared.kill.lock().unwrap(), CancellationToken::new());
        old.cancel();
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.kill.lock().unwrap().cancel();
    }
}

async fn accept(sock: TcpStream, security: Security, shared: &Shared) {
    match security {
        Security::Plain => serve(sock, shared).await,
        #[cfg(feature = "tls")]
        Security::Tls(acceptor) => {
            if let Ok(tls) = acceptor.accept(sock).await {
                serve(tls, shared).await;
            }
        }
    }
}

async fn serve<S>(mut sock: S, shared: &Shared)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::new();
    while !request.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        if sock.read_exact(&mut byte).await.is_err() {
            return;
        }
        request.push(byte[0]);
    }
    shared.handshakes.fetch_add(1, Ordering::SeqCst);

    let reply = shared.reply.lock().unwrap().clone();
    match reply {
        Reply::Hang => std::future::pending::<()>().await,
        Reply::Status(code, body) => {
            let reason = StatusCode::from_u16(code)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Unknown");
            let response = format!(
                "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(response.as_bytes()).await;
            let _ = sock.flush().await;
        }
        Reply::Switch => {
            let mut out =
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n"
                    .to_vec();
            out.extend_from_slice(*shared.greeting.lock().unwrap());
            if let Some(hello) = shared.hello.lock().unwrap().as_deref() {
                out.extend_from_slice(&frame(hello));
            }
            if sock.write_all(&out).await.is_err() || sock.flush().await.is_err() {
                return;
            }
            let _ = echo(&mut sock).await;
        }
    }
}

async fn echo<S>(sock: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = sock.read_u32().await? as usize;
        let mut body = vec![0u8; len];
        sock.read_exact(&mut body).await?;
        let payload = body.get(PUBLIC_KEY_SIZE..).unwrap_or_default();
        sock.write_all(&frame(payload)).await?;
        sock.flush().await?;
    }
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = (body.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

/// Factory for [`EchoSession`]s; clones share counters.
#[derive(Clone, Default)]
pub(crate) struct EchoFactory {
    established: Arc<AtomicUsize>,
    fail_sends: Arc<AtomicUsize>,
}

impl EchoFactory {
    pub(crate) fn established(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    /// Make the next `n` sends on any session fail.
    pub(crate) fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionFactory for EchoFactory {
    type Session = EchoSession;

    async fn establish(
        &self,
        _key: &PrivateKey,
        mut conn: Conn,
        _logf: &Logf,
    ) -> Result<EchoSession, SessionError> {
        let mut greeting = [0u8; 4];
        conn.read_exact(&mut greeting).await?;
        if &greeting != GREETING {
            return Err(format!("unexpected greeting {greeting:?}").into());
        }
        self.established.fetch_add(1, Ordering::SeqCst);

        let (reader, writer) = tokio::io::split(conn);
        Ok(EchoSession {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            fail_sends: Arc::clone(&self.fail_sends),
        })
    }
}

pub(crate) struct EchoSession {
    reader: Mutex<ReadHalf<Conn>>,
    writer: Mutex<WriteHalf<Conn>>,
    fail_sends: Arc<AtomicUsize>,
}

#[async_trait]
impl RelaySession for EchoSession {
    type Message = Vec<u8>;

    async fn send(&self, dst: &PublicKey, payload: &[u8]) -> Result<(), SessionError> {
        let injected = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err("injected send failure".into());
        }

        let mut body = dst.as_bytes().to_vec();
        body.extend_from_slice(payload);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame(&body)).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<Vec<u8>, SessionError> {
        let mut reader = self.reader.lock().await;
        let len = reader.read_u32().await? as usize;
        let dst = buf
            .get_mut(..len)
            .ok_or_else(|| format!("frame of {len} bytes exceeds buffer"))?;
        reader.read_exact(&mut *dst).await?;
        Ok(dst.to_vec())
    }
}
