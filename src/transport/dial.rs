//! Opens the raw byte stream to the relay: plain TCP or TCP + TLS.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
#[cfg(feature = "tls")]
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(feature = "tls")]
use tokio_rustls::{TlsConnector, client::TlsStream, rustls};

use super::endpoint::{Endpoint, Scheme};
use crate::client::ClientConfig;

/// A dialed transport, encrypted or not.
#[derive(Debug)]
pub enum MaybeTlsStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    /// Remote address of the underlying TCP stream.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Whether the stream is TLS-wrapped.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, MaybeTlsStream::Plain(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            MaybeTlsStream::Plain(s) => s,
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// Dials endpoints, holding the TLS client configuration.
pub(crate) struct Dialer {
    #[cfg(feature = "tls")]
    tls: OnceLock<TlsConnector>,
}

impl Dialer {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        #[cfg(feature = "tls")]
        {
            let tls = OnceLock::new();
            if let Some(tls_config) = &config.tls_config {
                let _ = tls.set(TlsConnector::from(Arc::clone(tls_config)));
            }
            Self { tls }
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = config;
            Self {}
        }
    }

    /// Open a stream to `endpoint`.
    ///
    /// Any stream opened before a later step fails is dropped, and with it
    /// the socket, before the error is returned.
    pub(crate) async fn dial(&self, endpoint: &Endpoint) -> io::Result<MaybeTlsStream> {
        let host = endpoint.host().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("endpoint {endpoint} has no host"),
            )
        })?;

        match endpoint.scheme() {
            Scheme::Https => self.dial_tls(endpoint, host).await,
            Scheme::Http => {
                let port = endpoint.dial_port().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "missing port in address")
                })?;
                let tcp = connect_tcp(&host, port).await?;
                Ok(MaybeTlsStream::Plain(tcp))
            }
            Scheme::Other(scheme) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported scheme {scheme:?}"),
            )),
        }
    }

    #[cfg(feature = "tls")]
    async fn dial_tls(&self, endpoint: &Endpoint, host: String) -> io::Result<MaybeTlsStream> {
        use rustls_pki_types::ServerName;

        let port = endpoint.dial_port().unwrap_or(crate::core::DEFAULT_HTTPS_PORT);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let tcp = connect_tcp(&host, port).await?;
        let tls = self.connector().connect(server_name, tcp).await?;
        Ok(MaybeTlsStream::Tls(Box::new(tls)))
    }

    #[cfg(not(feature = "tls"))]
    async fn dial_tls(&self, _endpoint: &Endpoint, _host: String) -> io::Result<MaybeTlsStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "https endpoints require the `tls` feature",
        ))
    }

    #[cfg(feature = "tls")]
    fn connector(&self) -> &TlsConnector {
        self.tls.get_or_init(|| {
            use rustls_platform_verifier::ConfigVerifierExt;

            TlsConnector::from(Arc::new(rustls::ClientConfig::with_platform_verifier()))
        })
    }
}

async fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}
