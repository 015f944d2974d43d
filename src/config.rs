use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Remote mapping store.  When absent the in-process cache is used.
    #[serde(default, alias = "redis")]
    pub keydb: Option<KeyDbConfig>,
}

impl Config {
    /// Path prefix under which pinned import paths are served
    /// (e.g. `/github.com`).
    pub fn mount_prefix(&self) -> String {
        format!("/{}", self.upstream.hostname)
    }
}

// ---------------------------------------------------------------------------
// Proxy / HTTP front end
// ---------------------------------------------------------------------------

/// Which entries a `?go-get=1` response on a pinned path lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Only the mapping recorded by the current request.
    #[default]
    Single,
    /// Every live mapping in the cache.
    Full,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8081`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory served for every request that is neither pinned nor a
    /// discovery request.
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    /// URL scheme advertised in discovery documents.
    #[serde(default = "default_discovery_scheme")]
    pub discovery_scheme: String,
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,
    /// Upper bound on the size of an inbound request head.
    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            static_dir: default_static_dir(),
            discovery_scheme: default_discovery_scheme(),
            discovery_mode: DiscoveryMode::default(),
            max_head_bytes: default_max_head_bytes(),
        }
    }
}

fn default_listen() -> String {
    "localhost:8081".to_string()
}

fn default_static_dir() -> String {
    "./static".to_string()
}

fn default_discovery_scheme() -> String {
    "http".to_string()
}

fn default_max_head_bytes() -> usize {
    64 * 1024
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Hostname of the upstream Git host.  Also used as TLS server name and
    /// as the mount prefix of pinned paths.
    #[serde(default = "default_upstream_hostname")]
    pub hostname: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    /// Branch whose advertisement is rewritten to the pinned commit.
    #[serde(default = "default_target_ref")]
    pub target_ref: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            hostname: default_upstream_hostname(),
            port: default_upstream_port(),
            target_ref: default_target_ref(),
        }
    }
}

fn default_upstream_hostname() -> String {
    "github.com".to_string()
}

fn default_upstream_port() -> u16 {
    443
}

fn default_target_ref() -> String {
    "master".to_string()
}

// ---------------------------------------------------------------------------
// Mapping cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a recorded mapping in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    /// How often (seconds) the in-process cache drops expired entries.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `redis://:secret@keydb.local:6379`).
    pub endpoint: String,
    /// Enable TLS for the connection.  Implied by a `rediss://` endpoint.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the auth token.  A
    /// password embedded in the endpoint takes precedence.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

impl KeyDbConfig {
    /// Build a config from a bare endpoint URL, as given on the command line.
    pub fn from_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            tls: endpoint.starts_with("rediss://"),
            auth_token_env: default_keydb_auth_env(),
        }
    }
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Longest accepted `cache.ttl`, one year.
pub const MAX_CACHE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.cache.ttl > 0, "cache.ttl must be positive");
    anyhow::ensure!(
        config.cache.ttl <= MAX_CACHE_TTL_SECS,
        "cache.ttl must be at most {MAX_CACHE_TTL_SECS} seconds"
    );
    anyhow::ensure!(
        config.cache.sweep_interval > 0,
        "cache.sweep_interval must be positive"
    );
    anyhow::ensure!(
        !config.upstream.hostname.is_empty() && !config.upstream.hostname.contains('/'),
        "upstream.hostname must be a bare host name"
    );
    anyhow::ensure!(
        !config.upstream.target_ref.is_empty()
            && !config.upstream.target_ref.starts_with('/')
            && !config.upstream.target_ref.contains(char::is_whitespace),
        "upstream.target_ref must be a branch name such as `master`"
    );
    anyhow::ensure!(
        matches!(config.proxy.discovery_scheme.as_str(), "http" | "https"),
        "proxy.discovery_scheme must be http or https"
    );
    anyhow::ensure!(
        config.proxy.max_head_bytes >= 1024,
        "proxy.max_head_bytes must be at least 1024"
    );
    Ok(())
}
