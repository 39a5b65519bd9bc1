//! Parsed relay server address.

use std::fmt;

use url::{Host, Url};

use crate::core::{ClientError, DEFAULT_HTTPS_PORT};

/// URL scheme of an [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP.
    Http,
    /// TCP wrapped in TLS.
    Https,
    /// Anything else. Accepted at parse time, rejected when dialing.
    Other(String),
}

impl Scheme {
    fn from_url(url: &Url) -> Self {
        match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => Scheme::Other(other.to_owned()),
        }
    }

}

/// Immutable description of the relay server: scheme, host, port, path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    scheme: Scheme,
    /// Port as written in the input, including a scheme's default port.
    port: Option<u16>,
}

impl Endpoint {
    /// Parse a URL such as `https://relay.example/derp`.
    ///
    /// Only syntax is checked here. An unsupported scheme or a missing
    /// host surfaces later as a dial error.
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let url = Url::parse(input)
            .map_err(|e| ClientError::InvalidEndpoint(format!("{input:?}: {e}")))?;
        let scheme = Scheme::from_url(&url);
        // `Url` drops a default port such as `:80`; put it back when the
        // input spelled one out.
        let port = url.port().or_else(|| {
            if has_explicit_port(input) {
                url.port_or_known_default()
            } else {
                None
            }
        });
        Ok(Self { url, scheme, port })
    }

    /// Endpoint scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Host as written, without IPv6 brackets.
    pub fn host(&self) -> Option<String> {
        match self.url.host()? {
            Host::Domain(d) => Some(d.to_owned()),
            Host::Ipv4(ip) => Some(ip.to_string()),
            Host::Ipv6(ip) => Some(ip.to_string()),
        }
    }

    /// Port as written, `None` when the URL has none.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to dial. Encrypted endpoints default to 443; plain ones get no
    /// default and must name their port.
    pub fn dial_port(&self) -> Option<u16> {
        match self.scheme {
            Scheme::Https => Some(self.port.unwrap_or(DEFAULT_HTTPS_PORT)),
            _ => self.port,
        }
    }

    /// Request target for the upgrade request line: path plus query.
    pub fn request_target(&self) -> String {
        let path = self.url.path();
        let path = if path.is_empty() { "/" } else { path };
        match self.url.query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_owned(),
        }
    }

    /// Value of the `Host` header: host, plus port when written explicitly.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Underlying URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Whether the authority of `input` ends in `:<digits>`.
fn has_explicit_port(input: &str) -> bool {
    let Some((_, rest)) = input.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    // Skip an IPv6 literal so its colons are not taken for a port separator.
    let after_host = match host_port.rfind(']') {
        Some(end) => &host_port[end + 1..],
        None => host_port,
    };
    after_host
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.url, f)
    }
}
