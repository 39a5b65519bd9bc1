//! HTTP/1.1 upgrade handshake that turns a dialed stream into a tunnel.
//!
//! The request is indistinguishable from a WebSocket upgrade. The request
//! and the response share one [`BufStream`], so any protocol bytes the
//! server sends right after `101 Switching Protocols` stay buffered for the
//! relay session instead of being lost.

use std::fmt::Write as _;
use std::io;

use http::header::{self, InvalidHeaderValue};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use super::endpoint::Endpoint;
use crate::core::{
    CONNECTION_UPGRADE, HandshakeError, MAX_REJECTION_BODY_SIZE, MAX_RESPONSE_HEAD_SIZE,
    MAX_RESPONSE_HEADERS,
};

/// The upgrade request sent to the relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    target: String,
    host: String,
    upgrade_token: HeaderValue,
    user_agent: Option<HeaderValue>,
}

impl UpgradeRequest {
    /// Request for `endpoint`, asking to upgrade to `upgrade_token`.
    ///
    /// Fails when the token is not a valid header value, e.g. when it
    /// contains a line break.
    pub fn new(endpoint: &Endpoint, upgrade_token: &str) -> Result<Self, InvalidHeaderValue> {
        Ok(Self {
            target: endpoint.request_target(),
            host: endpoint.host_header(),
            upgrade_token: HeaderValue::from_str(upgrade_token)?,
            user_agent: None,
        })
    }

    /// Add a `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Result<Self, InvalidHeaderValue> {
        self.user_agent = user_agent.map(HeaderValue::from_str).transpose()?;
        Ok(self)
    }

    /// Wire form of the request.
    pub fn render(&self) -> String {
        let mut out = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", self.target, self.host);
        if let Some(ua) = &self.user_agent {
            let _ = write!(out, "User-Agent: {}\r\n", text(ua));
        }
        let _ = write!(
            out,
            "Upgrade: {}\r\nConnection: {}\r\n\r\n",
            text(&self.upgrade_token),
            CONNECTION_UPGRADE
        );
        out
    }
}

// Values built with `HeaderValue::from_str` are visible ASCII.
fn text(value: &HeaderValue) -> &str {
    value.to_str().unwrap_or_default()
}

/// Metadata of a successful upgrade response.
///
/// Carries no body: after a 101 every further byte belongs to the relay
/// protocol.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    status: StatusCode,
    headers: HeaderMap,
}

impl UpgradeResponse {
    /// Response status (always 101 for a stored response).
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name` as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    fn from_parsed(parsed: &httparse::Response<'_, '_>) -> Result<Self, HandshakeError> {
        let code = parsed
            .code
            .ok_or_else(|| HandshakeError::Malformed("missing status code".into()))?;
        let status =
            StatusCode::from_u16(code).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
            headers.append(name, value);
        }
        Ok(Self { status, headers })
    }
}

/// Perform the upgrade over `conn`.
///
/// Writes and flushes the request, then reads the response head from the
/// same buffer. Anything but 101 fails with [`HandshakeError::Rejected`]
/// after the (bounded) body has been drained for diagnostics.
pub async fn upgrade<S>(
    conn: &mut BufStream<S>,
    request: &UpgradeRequest,
) -> Result<UpgradeResponse, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(request.render().as_bytes()).await?;
    // Without the flush the request sits in the write buffer and the
    // server never answers.
    conn.flush().await?;

    let response = read_response_head(conn).await?;
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        let body = read_rejection_body(conn, &response).await;
        return Err(HandshakeError::Rejected {
            status: response.status,
            body,
        });
    }
    Ok(response)
}

/// Parse the status line and headers, consuming exactly their bytes.
async fn read_response_head<R>(reader: &mut R) -> Result<UpgradeResponse, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before upgrade response",
            )
            .into());
        }
        let seen = head.len();
        let chunk_len = chunk.len();
        head.extend_from_slice(chunk);

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&head)? {
            httparse::Status::Complete(len) => {
                let response = UpgradeResponse::from_parsed(&parsed)?;
                reader.consume(len - seen);
                return Ok(response);
            }
            httparse::Status::Partial => {
                reader.consume(chunk_len);
                if head.len() > MAX_RESPONSE_HEAD_SIZE {
                    return Err(HandshakeError::HeadTooLarge {
                        limit: MAX_RESPONSE_HEAD_SIZE,
                    });
                }
            }
        }
    }
}

/// Drain the body of a rejected upgrade, keeping at most
/// [`MAX_REJECTION_BODY_SIZE`] bytes. Read errors end the body early.
async fn read_rejection_body<R>(reader: &mut R, response: &UpgradeResponse) -> String
where
    R: AsyncBufRead + Unpin,
{
    if !has_body(response.status) {
        return String::new();
    }

    let headers = &response.headers;
    let mut body = Vec::new();
    let limit = MAX_REJECTION_BODY_SIZE as u64;

    let result = if is_chunked(headers) {
        read_chunked(reader, &mut body).await
    } else {
        let len = content_length(headers).map_or(limit, |len| len.min(limit));
        (&mut *reader).take(len).read_to_end(&mut body).await.map(drop)
    };
    if let Err(error) = result {
        tracing::debug!(%error, read = body.len(), "rejected upgrade body cut short");
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// 1xx, 204 and 304 responses end with their head (RFC 9112, section 6.3).
fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(header::CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

async fn read_chunked<R>(reader: &mut R, body: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        (&mut *reader).take(1024).read_line(&mut line).await?;
        let size = line.trim().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size.trim(), 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;
        if size == 0 {
            return Ok(());
        }

        let keep = size.min(MAX_REJECTION_BODY_SIZE - body.len());
        let start = body.len();
        body.resize(start + keep, 0);
        reader.read_exact(&mut body[start..]).await?;
        if keep < size {
            return Ok(());
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}
