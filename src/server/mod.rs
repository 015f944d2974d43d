//! Connection-level serving.
//!
//! Each accepted connection gets its own task.  The request head is read off
//! the socket first; pinned protocol requests are handed to the proxy engine
//! together with the raw stream, and everything else is replayed into hyper
//! and served by the axum router.  Connections serve a single request.

pub mod exchange;
pub mod head;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument};

use self::exchange::{Exchange, BAD_REQUEST_RESPONSE};
use self::head::read_head;
use crate::path::PathTriple;
use crate::router::{route, Route};
use crate::AppState;

/// Accept connections until `shutdown` resolves.
pub async fn run<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F)
where
    F: Future<Output = ()>,
{
    let app = crate::http::handler::create_router(Arc::clone(&state));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "could not set TCP_NODELAY");
                        }
                        let state = Arc::clone(&state);
                        let app = app.clone();
                        tokio::spawn(
                            handle_connection(stream, state, app)
                                .instrument(info_span!("conn", %peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            () = &mut shutdown => {
                info!("listener stopped");
                break;
            }
        }
    }
}

/// Serve one request on `stream`.
pub async fn handle_connection<S>(mut stream: S, state: Arc<AppState>, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (head, buf, head_len) = match read_head(&mut stream, state.config.proxy.max_head_bytes).await
    {
        Ok(Some(parts)) => parts,
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "rejecting request");
            let _ = stream.write_all(BAD_REQUEST_RESPONSE).await;
            let _ = stream.shutdown().await;
            return;
        }
    };
    debug!(
        method = %head.method,
        target = %head.target,
        user_agent = ?head.header("user-agent").map(String::from_utf8_lossy),
        "request"
    );

    let mut exchange = Exchange::new(stream, head, buf, head_len);
    let mount_prefix = state.config.mount_prefix();
    match route(exchange.head().path(), exchange.head().query(), &mount_prefix) {
        Route::Proxy(triple) => proxy_exchange(&state, &triple, &mut exchange).await,
        _ => serve_http(exchange, app).await,
    }
}

async fn proxy_exchange<S>(state: &AppState, triple: &PathTriple, exchange: &mut Exchange<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let metrics = &state.metrics.metrics;
    metrics.active_proxy_connections.inc();
    let started = Instant::now();

    let result = state.proxy.serve(triple, exchange).await;

    metrics.active_proxy_connections.dec();
    metrics.observe_exchange(result.as_ref().map(|_| ()), started.elapsed().as_secs_f64());

    match result {
        Ok(()) => debug!(repo = %triple.repo_slug(), subpath = %triple.subpath, "exchange complete"),
        Err(e) => {
            warn!(error = %e, repo = %triple.repo_slug(), subpath = %triple.subpath, "proxied exchange failed");
            if let Err(e) = exchange.respond_not_found().await {
                debug!(error = %e, "could not send not-found to client");
            }
        }
    }
}

/// Replay the buffered request into hyper and serve it with `app`.
async fn serve_http<S>(exchange: Exchange<S>, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(conn) = exchange.into_replay() else {
        return;
    };
    let io = TokioIo::new(conn);
    let service = TowerToHyperService::new(app);

    if let Err(err) = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(io, service)
        .await
    {
        debug!(error = ?err, "connection ended");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::config::Config;
    use crate::server::exchange::NOT_FOUND_RESPONSE;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    /// Write `request` on a fresh in-memory connection and collect the reply.
    async fn exchange_bytes(state: Arc<AppState>, request: &[u8]) -> Vec<u8> {
        let (mut client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let app = crate::http::handler::create_router(Arc::clone(&state));
        let task = tokio::spawn(handle_connection(server, state, app));

        client.write_all(request).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        task.await.unwrap();
        reply
    }

    #[tokio::test]
    async fn discovery_is_served_over_the_connection() {
        let state = AppState::for_tests(Config::default());
        let request = format!(
            "GET /github.com/myorg/myrepo/{HASH}?go-get=1 HTTP/1.1\r\nHost: gopin.example\r\n\r\n"
        );
        let reply = exchange_bytes(Arc::clone(&state), request.as_bytes()).await;
        let reply = String::from_utf8(reply).unwrap();

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.to_ascii_lowercase().contains("content-type: text/html; charset=utf-8"));
        assert!(reply.ends_with(&format!(
            r#"<meta name="go-import" content="gopin.example/github.com/myorg/myrepo/{HASH} git http://gopin.example/github.com/myorg/myrepo/{HASH}"></head>"#
        )));
        assert_eq!(state.metrics.metrics.cache_adds.get(), 1);
    }

    #[tokio::test]
    async fn malformed_head_is_rejected() {
        let state = AppState::for_tests(Config::default());
        let reply = exchange_bytes(state, b"NOT HTTP AT ALL\r\n\r\n").await;
        assert_eq!(reply, BAD_REQUEST_RESPONSE);
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut config = Config::default();
        config.proxy.max_head_bytes = 1024;
        let state = AppState::for_tests(config);
        let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(4096));
        let reply = exchange_bytes(state, &request).await;
        assert_eq!(reply, BAD_REQUEST_RESPONSE);
    }

    #[tokio::test]
    async fn unreachable_upstream_answers_not_found() {
        let mut config = Config::default();
        config.upstream.hostname = "localhost".to_string();
        config.upstream.port = 1;
        let state = AppState::for_tests(config);

        let request = format!(
            "GET /localhost/myorg/myrepo/{HASH}/info/refs?service=git-upload-pack HTTP/1.1\r\n\
             Host: gopin.example\r\n\r\n"
        );
        let reply = exchange_bytes(Arc::clone(&state), request.as_bytes()).await;
        assert_eq!(reply, NOT_FOUND_RESPONSE);
        assert_eq!(state.metrics.metrics.upstream_dial_failures.get(), 1);
        assert_eq!(state.metrics.metrics.active_proxy_connections.get(), 0);
    }

    #[tokio::test]
    async fn closed_before_request_is_ignored() {
        let state = AppState::for_tests(Config::default());
        let (mut client, server) = tokio::io::duplex(1024);
        let app = crate::http::handler::create_router(Arc::clone(&state));
        let task = tokio::spawn(handle_connection(server, state, app));

        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        task.await.unwrap();
        assert!(reply.is_empty());
    }
}
