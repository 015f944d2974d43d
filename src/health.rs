use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::cache::store::KeyValueStore;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub cache_backend: &'static str,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Absent when the in-process cache is in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keydb: Option<CheckResult>,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_keydb(store: &dyn KeyValueStore) -> CheckResult {
    match store.ping_store().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

async fn check_upstream(client: &reqwest::Client, hostname: &str, port: u16) -> CheckResult {
    let url = if port == 443 {
        format!("https://{hostname}/")
    } else {
        format!("https://{hostname}:{port}/")
    };
    match client.head(&url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {} returned {}", url, resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {} failed: {e}", url)),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // A configured mapping store is required for discovery to work.
    let store_ok = checks.keydb.as_ref().is_none_or(|c| c.ok);

    if !store_ok {
        HealthStatus::Unhealthy
    } else if checks.upstream.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let upstream = &state.config.upstream;
    let keydb_check = async {
        match &state.keydb {
            Some(pool) => Some(check_keydb(pool).await),
            None => None,
        }
    };
    let (keydb, upstream) = tokio::join!(
        keydb_check,
        check_upstream(&state.http_client, &upstream.hostname, upstream.port),
    );

    let checks = HealthChecks { keydb, upstream };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        cache_backend: state.cache.backend(),
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(keydb: Option<bool>, upstream: bool) -> HealthChecks {
        let result = |ok| {
            if ok {
                CheckResult::healthy()
            } else {
                CheckResult::unhealthy("down")
            }
        };
        HealthChecks {
            keydb: keydb.map(result),
            upstream: result(upstream),
        }
    }

    #[test]
    fn status_aggregation() {
        assert_eq!(aggregate_status(&checks(None, true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(Some(true), true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(None, false)), HealthStatus::Degraded);
        assert_eq!(
            aggregate_status(&checks(Some(true), false)),
            HealthStatus::Degraded
        );
        assert_eq!(
            aggregate_status(&checks(Some(false), true)),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn missing_keydb_check_is_omitted() {
        let body = HealthResponse {
            status: HealthStatus::Ok,
            cache_backend: "memory",
            checks: checks(None, true),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["checks"].get("keydb").is_none());
        assert_eq!(json["checks"]["upstream"]["ok"], true);
        assert!(json["checks"]["upstream"].get("detail").is_none());
    }
}
