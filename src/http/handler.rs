//! axum router for everything that is not proxied on the raw connection.
//!
//! Routes:
//! - `GET /healthz`                                   - Health check
//! - `GET /metrics`                                   - Prometheus metrics
//! - `GET /<host>/<owner>/<repo>/<commit>?go-get=1`   - Record and render a mapping
//! - `GET /<anything>?go-get=1`                       - Render every live mapping
//! - anything else                                    - Static content

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, instrument};

use crate::cache::MappingEntry;
use crate::config::DiscoveryMode;
use crate::discovery::render_go_import;
use crate::metrics::{DiscoveryKind, DiscoveryLabels};
use crate::path::PathTriple;
use crate::router::{route, Route};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_request)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_request(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, AppError> {
    let mount_prefix = state.config.mount_prefix();
    let host = request_host(&state, &req);

    match route(req.uri().path(), req.uri().query(), &mount_prefix) {
        Route::Discover(triple) => Ok(handle_discovery(&state, &triple, &host).await),
        Route::ListCache => Ok(handle_list_cache(&state, &host).await),
        Route::Site => serve_static(&state, req).await,
        Route::NotFound => Err(AppError::NotFound),
        Route::Proxy(triple) => {
            // Pinned protocol requests never reach the router on the normal
            // path; answer like any unknown path.
            debug!(repo = %triple.repo_slug(), "proxy route reached the HTTP router");
            Err(AppError::NotFound)
        }
    }
}

/// `GET /<host>/<owner>/<repo>/<commit>[/...]?go-get=1`
///
/// Records the mapping for this import path and answers with a discovery
/// document.
#[instrument(skip(state, triple), fields(owner = %triple.owner, repo = %triple.repo, commit = %triple.commit_hash))]
async fn handle_discovery(state: &AppState, triple: &PathTriple, host: &str) -> Response {
    let upstream_host = &state.config.upstream.hostname;
    let entry = MappingEntry::new(
        triple.import_path(upstream_host),
        triple.repo_location(upstream_host),
    );

    state.cache.add(entry.clone()).await;
    state.metrics.metrics.cache_adds.inc();
    state
        .metrics
        .metrics
        .discovery_requests
        .get_or_create(&DiscoveryLabels {
            kind: DiscoveryKind::Pinned,
        })
        .inc();
    info!(import_path = %entry.import_path, "mapping recorded");

    let scheme = &state.config.proxy.discovery_scheme;
    let doc = match state.config.proxy.discovery_mode {
        DiscoveryMode::Single => render_go_import(host, scheme, std::iter::once(&entry)),
        DiscoveryMode::Full => {
            let entries: Vec<MappingEntry> = state.cache.iter().collect().await;
            render_go_import(host, scheme, &entries)
        }
    };
    html(doc)
}

/// `GET /<anything outside the mount>?go-get=1`
async fn handle_list_cache(state: &AppState, host: &str) -> Response {
    state
        .metrics
        .metrics
        .discovery_requests
        .get_or_create(&DiscoveryLabels {
            kind: DiscoveryKind::Listing,
        })
        .inc();

    let entries: Vec<MappingEntry> = state.cache.iter().collect().await;
    debug!(count = entries.len(), backend = state.cache.backend(), "listing cache");
    html(render_go_import(
        host,
        &state.config.proxy.discovery_scheme,
        &entries,
    ))
}

async fn serve_static(state: &AppState, req: Request) -> Result<Response, AppError> {
    let service =
        ServeDir::new(&state.config.proxy.static_dir).append_index_html_on_directories(true);
    match service.oneshot(req).await {
        Ok(resp) if resp.status() == StatusCode::NOT_FOUND => Err(AppError::NotFound),
        Ok(resp) => Ok(resp.map(Body::new)),
        Err(never) => match never {},
    }
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Host name the client addressed, used as the prefix of advertised import
/// paths.  Falls back to the listen address.
fn request_host(state: &AppState, req: &Request) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .map_or_else(|| state.config.proxy.listen.clone(), str::to_owned)
}

fn html(doc: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        doc,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Every failure is reported to the client as a bare "not found".
#[derive(Debug)]
pub enum AppError {
    NotFound,
    /// An unexpected internal error.  Logged, never shown.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(err) = &self {
            error!(error = %err, "internal server error");
        }
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Not found\n",
        )
            .into_response()
    }
}
