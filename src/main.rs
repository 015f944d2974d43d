mod cache;
mod config;
mod discovery;
mod health;
mod http;
mod metrics;
mod path;
mod proxy;
mod router;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fred::clients::Pool;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::MappingCache;
use crate::config::{Config, KeyDbConfig};
use crate::metrics::MetricsRegistry;
use crate::proxy::{ProxyEngine, TlsUpstream};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "gopin",
    about = "Vanity import paths that pin a Git repository to a commit"
)]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults apply when
    /// omitted.
    #[arg(short, long, env = "GOPIN_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the listener to.
    #[arg(short, long, env = "GOPIN_LISTEN")]
    listen: Option<String>,

    /// URL of a KeyDB/Redis database for the mapping cache
    /// (`redis://[:password@]host:port`).
    #[arg(short, long, env = "GOPIN_REDIS")]
    redis: Option<String>,

    /// Seconds to keep requested import paths.
    #[arg(long, env = "GOPIN_CACHE_TTL")]
    cache_ttl: Option<u64>,

    /// Path to the static content directory.
    #[arg(long, env = "GOPIN_STATIC_DIR")]
    static_dir: Option<String>,
}

impl Cli {
    /// Command-line values win over the configuration file.
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.proxy.listen = listen.clone();
        }
        if let Some(redis) = &self.redis {
            config.keydb = Some(KeyDbConfig::from_endpoint(redis));
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache.ttl = ttl;
        }
        if let Some(dir) = &self.static_dir {
            config.proxy.static_dir = dir.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<dyn MappingCache>,
    /// Present when the mapping cache lives in KeyDB.
    pub keydb: Option<Pool>,
    pub proxy: Arc<ProxyEngine>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
}

#[cfg(test)]
impl AppState {
    /// State with an in-process cache and no network activity at
    /// construction.
    pub fn for_tests(config: Config) -> Arc<Self> {
        let metrics = MetricsRegistry::new();
        let proxy = ProxyEngine::new(
            TlsUpstream::new(&config.upstream).unwrap(),
            config.upstream.target_ref.clone(),
        )
        .with_rewrite_counter(metrics.metrics.ref_rewrites.clone());
        Arc::new(Self {
            cache: Arc::new(cache::MemoryCache::new(std::time::Duration::from_secs(
                config.cache.ttl,
            ))),
            keydb: None,
            proxy: Arc::new(proxy),
            metrics,
            http_client: reqwest::Client::new(),
            config: Arc::new(config),
        })
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config::validate_config(&config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting gopin");

    // ---- Infrastructure clients ----
    let keydb = match &config.keydb {
        Some(keydb_config) => Some(cache::store::create_keydb_pool(keydb_config).await?),
        None => None,
    };

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("gopin/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Mapping cache ----
    let cache = cache::build_cache(
        &config.cache,
        keydb.clone(),
        metrics.metrics.cache_backend_errors.clone(),
    );
    tracing::info!(
        backend = cache.backend(),
        ttl_secs = config.cache.ttl,
        "mapping cache ready"
    );

    // ---- Proxy engine ----
    let upstream = TlsUpstream::new(&config.upstream)?;
    let proxy = Arc::new(
        ProxyEngine::new(upstream, config.upstream.target_ref.clone())
            .with_rewrite_counter(metrics.metrics.ref_rewrites.clone()),
    );
    tracing::info!(
        upstream = proxy.upstream_host(),
        target_ref = %config.upstream.target_ref,
        "proxy engine initialised"
    );

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        cache,
        keydb,
        proxy,
        metrics,
        http_client,
    });

    // ---- Serve ----
    let listener = tokio::net::TcpListener::bind(&config.proxy.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.proxy.listen))?;
    tracing::info!(
        listen = %config.proxy.listen,
        mount = %config.mount_prefix(),
        "gopin listening"
    );

    server::run(listener, state, shutdown_signal()).await;

    tracing::info!("gopin shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "gopin",
            "--listen",
            "0.0.0.0:9000",
            "--redis",
            "rediss://:secret@keydb.internal:6380",
            "--cache-ttl",
            "60",
            "--static-dir",
            "/srv/gopin",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.proxy.listen, "0.0.0.0:9000");
        assert_eq!(config.cache.ttl, 60);
        assert_eq!(config.proxy.static_dir, "/srv/gopin");
        let keydb = config.keydb.unwrap();
        assert_eq!(keydb.endpoint, "rediss://:secret@keydb.internal:6380");
        assert!(keydb.tls);
    }

    #[test]
    fn no_flags_keep_config() {
        let cli = Cli::parse_from(["gopin"]);
        let mut config = Config::default();
        config.proxy.listen = "127.0.0.1:1".to_string();
        cli.apply(&mut config);
        assert_eq!(config.proxy.listen, "127.0.0.1:1");
        assert!(config.keydb.is_none());
        assert_eq!(config.cache.ttl, 300);
    }
}
