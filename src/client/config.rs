//! Client configuration and its builder.

#[cfg(feature = "tls")]
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tls")]
use tokio_rustls::rustls;

use crate::core::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_UPGRADE_TOKEN};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on one connection attempt: dial, TLS, upgrade, session setup.
    pub connect_timeout: Duration,

    /// Value of the `Upgrade:` request header.
    pub upgrade_token: String,

    /// Optional `User-Agent` request header.
    pub user_agent: Option<String>,

    /// TLS client configuration. The platform verifier is used when unset.
    #[cfg(feature = "tls")]
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upgrade_token: DEFAULT_UPGRADE_TOKEN.to_owned(),
            user_agent: None,
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the `Upgrade:` header value.
    pub fn upgrade_token(mut self, token: impl Into<String>) -> Self {
        self.config.upgrade_token = token.into();
        self
    }

    /// Set the `User-Agent` header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Use a specific TLS client configuration.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls_config = Some(config);
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
