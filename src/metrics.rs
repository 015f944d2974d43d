use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExchangeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Ok,
    UpstreamUnavailable,
    TakeoverFailed,
    RefNotFound,
    UpstreamWriteFailed,
    RelayInterrupted,
}

impl Outcome {
    pub fn of(error: &crate::proxy::ProxyError) -> Self {
        use crate::proxy::ProxyError;
        match error {
            ProxyError::UpstreamDialFailed(_) => Self::UpstreamUnavailable,
            ProxyError::ConnectionTakeoverFailed(_) => Self::TakeoverFailed,
            ProxyError::RefNotFoundBeforeStreamEnd { .. } => Self::RefNotFound,
            ProxyError::UpstreamWriteFailed(_) => Self::UpstreamWriteFailed,
            ProxyError::RelayInterrupted(_) => Self::RelayInterrupted,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DiscoveryLabels {
    pub kind: DiscoveryKind,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DiscoveryKind {
    Pinned,
    Listing,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by gopin.
pub struct Metrics {
    // -- discovery --
    pub discovery_requests: Family<DiscoveryLabels, Counter>,
    pub cache_adds: Counter,
    pub cache_backend_errors: Counter,

    // -- proxy --
    pub proxy_exchanges: Family<ExchangeLabels, Counter>,
    pub proxy_duration_seconds: Histogram,
    pub ref_rewrites: Counter,
    pub upstream_dial_failures: Counter,

    // -- gauges --
    pub active_proxy_connections: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let discovery_requests = Family::<DiscoveryLabels, Counter>::default();
        registry.register(
            "gopin_discovery_requests",
            "Discovery requests by kind",
            discovery_requests.clone(),
        );

        let cache_adds = Counter::default();
        registry.register(
            "gopin_cache_adds",
            "Import path mappings recorded",
            cache_adds.clone(),
        );

        let cache_backend_errors = Counter::default();
        registry.register(
            "gopin_cache_backend_errors",
            "Mapping store operations that failed and were skipped",
            cache_backend_errors.clone(),
        );

        let proxy_exchanges = Family::<ExchangeLabels, Counter>::default();
        registry.register(
            "gopin_proxy_exchanges",
            "Proxied smart-HTTP exchanges by outcome",
            proxy_exchanges.clone(),
        );

        let proxy_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "gopin_proxy_duration_seconds",
            "Duration of proxied exchanges in seconds",
            proxy_duration_seconds.clone(),
        );

        let ref_rewrites = Counter::default();
        registry.register(
            "gopin_ref_rewrites",
            "Reference advertisements pinned to a commit",
            ref_rewrites.clone(),
        );

        let upstream_dial_failures = Counter::default();
        registry.register(
            "gopin_upstream_dial_failures",
            "Failed TLS connections to the upstream host",
            upstream_dial_failures.clone(),
        );

        let active_proxy_connections: Gauge = Gauge::default();
        registry.register(
            "gopin_active_proxy_connections",
            "Proxied exchanges currently in flight",
            active_proxy_connections.clone(),
        );

        Self {
            discovery_requests,
            cache_adds,
            cache_backend_errors,
            proxy_exchanges,
            proxy_duration_seconds,
            ref_rewrites,
            upstream_dial_failures,
            active_proxy_connections,
        }
    }

    /// Record the end of a proxied exchange.
    pub fn observe_exchange(
        &self,
        result: Result<(), &crate::proxy::ProxyError>,
        elapsed_secs: f64,
    ) {
        let outcome = match result {
            Ok(()) => Outcome::Ok,
            Err(e) => Outcome::of(e),
        };
        if outcome == Outcome::UpstreamUnavailable {
            self.upstream_dial_failures.inc();
        }
        self.proxy_exchanges
            .get_or_create(&ExchangeLabels { outcome })
            .inc();
        self.proxy_duration_seconds.observe(elapsed_secs);
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::proxy::ProxyError;

    #[test]
    fn exchange_outcomes_are_labelled() {
        let registry = MetricsRegistry::new();
        let metrics = &registry.metrics;

        metrics.observe_exchange(Ok(()), 0.2);
        metrics.observe_exchange(
            Err(&ProxyError::UpstreamDialFailed(io::Error::other("refused"))),
            0.01,
        );
        metrics.observe_exchange(
            Err(&ProxyError::RefNotFoundBeforeStreamEnd {
                target_ref: "master".to_string(),
            }),
            0.5,
        );

        assert_eq!(metrics.upstream_dial_failures.get(), 1);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"gopin_proxy_exchanges_total{outcome="Ok"} 1"#));
        assert!(text.contains(r#"gopin_proxy_exchanges_total{outcome="RefNotFound"} 1"#));
        assert!(text.contains("gopin_proxy_duration_seconds_count 3"));
    }

    #[test]
    fn outcome_matches_error_label() {
        let err = ProxyError::ConnectionTakeoverFailed("gone".to_string());
        assert_eq!(Outcome::of(&err), Outcome::TakeoverFailed);
    }
}
