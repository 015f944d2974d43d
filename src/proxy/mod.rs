//! Transparent smart-HTTP proxy to the upstream Git host.
//!
//! A pinned request is forwarded on the raw client connection: the engine
//! dials the upstream, detaches the client stream from the serving layer,
//! sends a rewritten request head and then relays bytes in both directions.
//! For `info/refs` the advertisement of the target branch is rewritten to the
//! pinned commit before the rest of the response is streamed through.

pub mod refs;
pub mod request;
pub mod upstream;

use std::io;

use prometheus_client::metrics::counter::Counter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, trace, warn};

use crate::path::PathTriple;
use crate::server::exchange::{Exchange, NOT_FOUND_RESPONSE};

pub use upstream::{TlsUpstream, Upstream};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Ways a proxied exchange can fail.  Clients only ever see "not found".
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream unavailable: {0}")]
    UpstreamDialFailed(#[source] io::Error),
    #[error("connection takeover failed: {0}")]
    ConnectionTakeoverFailed(String),
    #[error("refs/heads/{target_ref} not advertised before end of upstream stream")]
    RefNotFoundBeforeStreamEnd { target_ref: String },
    #[error("failed to write request upstream: {0}")]
    UpstreamWriteFailed(#[source] io::Error),
    #[error("relay interrupted: {0}")]
    RelayInterrupted(#[source] io::Error),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ProxyEngine<U = TlsUpstream> {
    upstream: U,
    target_ref: String,
    rewrites: Counter,
}

impl<U: Upstream> ProxyEngine<U> {
    pub fn new(upstream: U, target_ref: impl Into<String>) -> Self {
        Self {
            upstream,
            target_ref: target_ref.into(),
            rewrites: Counter::default(),
        }
    }

    /// Count rewritten advertisements on `counter` (usually a registered
    /// metric).
    pub fn with_rewrite_counter(mut self, counter: Counter) -> Self {
        self.rewrites = counter;
        self
    }

    pub fn upstream_host(&self) -> &str {
        self.upstream.host()
    }

    /// Proxy one pinned request.
    ///
    /// On failure before the client stream has been detached the caller still
    /// owns the exchange and must answer it.  After detaching, the engine
    /// answers 404 itself when no response bytes have been sent yet.  Both
    /// connections are closed by the time this returns.
    #[instrument(skip_all, fields(owner = %triple.owner, repo = %triple.repo, subpath = %triple.subpath))]
    pub async fn serve<S>(
        &self,
        triple: &PathTriple,
        exchange: &mut Exchange<S>,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upstream = self.upstream.connect().await?;
        let request = request::encode_upstream_request(
            exchange.head(),
            self.upstream.host(),
            &triple.upstream_path(),
        );
        let client = exchange.hijack()?;
        debug!(buffered = client.pending().len(), "client connection detached");

        self.relay(triple, &request, client, upstream).await
    }

    async fn relay<C>(
        &self,
        triple: &PathTriple,
        request: &[u8],
        client: C,
        upstream: U::Conn,
    ) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let (upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

        if let Err(e) = upstream_tx.write_all(request).await {
            close_with_not_found(&mut client_tx).await;
            return Err(ProxyError::UpstreamWriteFailed(e));
        }

        // Client -> upstream, unmodified, for as long as the exchange lasts.
        let forward = tokio::spawn(async move {
            match tokio::io::copy(&mut client_rx, &mut upstream_tx).await {
                Ok(bytes) => trace!(bytes, "client stream finished"),
                Err(e) => debug!(error = %e, "client to upstream copy stopped"),
            }
        });

        let mut upstream_rx = BufReader::new(upstream_rx);
        let result = async {
            if triple.is_ref_advertisement() {
                let head =
                    refs::inject_head(&mut upstream_rx, &triple.commit_hash, &self.target_ref)
                        .await?;
                client_tx
                    .write_all(&head)
                    .await
                    .map_err(ProxyError::RelayInterrupted)?;
                self.rewrites.inc();
            }
            let bytes = tokio::io::copy_buf(&mut upstream_rx, &mut client_tx)
                .await
                .map_err(ProxyError::RelayInterrupted)?;
            trace!(bytes, "upstream stream finished");
            Ok(())
        }
        .await;

        if let Err(ProxyError::RefNotFoundBeforeStreamEnd { .. }) = &result {
            close_with_not_found(&mut client_tx).await;
        } else if let Err(e) = client_tx.shutdown().await {
            trace!(error = %e, "client shutdown failed");
        }

        // Dropping the forwarder releases its halves of both connections.
        forward.abort();
        let _ = forward.await;

        result
    }
}

async fn close_with_not_found<W: AsyncWrite + Unpin>(client: &mut W) {
    if let Err(e) = client.write_all(NOT_FOUND_RESPONSE).await {
        warn!(error = %e, "could not send not-found to client");
    }
    let _ = client.shutdown().await;
}
