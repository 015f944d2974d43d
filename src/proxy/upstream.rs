//! TLS connections to the upstream Git host.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::ProxyError;
use crate::config::UpstreamConfig;

/// Source of fresh upstream connections.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Host name the proxied requests are addressed to.
    fn host(&self) -> &str;

    async fn connect(&self) -> Result<Self::Conn, ProxyError>;
}

/// Dials `hostname:port` over TLS with SNI set to `hostname`, trusting the
/// Mozilla root set.
pub struct TlsUpstream {
    hostname: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl TlsUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(config.hostname.clone())
            .with_context(|| format!("invalid upstream hostname: {}", config.hostname))?;

        Ok(Self {
            hostname: config.hostname.clone(),
            port: config.port,
            server_name,
            connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }
}

#[async_trait::async_trait]
impl Upstream for TlsUpstream {
    type Conn = TlsStream<TcpStream>;

    fn host(&self) -> &str {
        &self.hostname
    }

    async fn connect(&self) -> Result<Self::Conn, ProxyError> {
        let tcp = TcpStream::connect((self.hostname.as_str(), self.port))
            .await
            .map_err(ProxyError::UpstreamDialFailed)?;
        tcp.set_nodelay(true).map_err(ProxyError::UpstreamDialFailed)?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(ProxyError::UpstreamDialFailed)?;

        debug!(host = %self.hostname, port = self.port, "upstream TLS session established");
        Ok(tls)
    }
}
