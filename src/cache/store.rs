//! KeyDB / Redis access for the remote mapping cache.
//!
//! [`KeyValueStore`] is the narrow command surface the remote cache relies
//! on (`SET`, `EXPIRE`, `GET`, `KEYS`, `PING`).  It is implemented for
//! [`fred::clients::Pool`]; tests substitute an in-memory recorder.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, CustomCommand};

use crate::config::KeyDbConfig;

const POOL_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// Command surface
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `SET key value`
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;
    /// `EXPIRE key seconds`
    async fn expire_key(&self, key: &str, seconds: i64) -> Result<()>;
    /// `GET key`
    async fn get_value(&self, key: &str) -> Result<Option<String>>;
    /// `KEYS pattern`
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>>;
    /// `PING`
    async fn ping_store(&self) -> Result<()>;
}

#[async_trait::async_trait]
impl KeyValueStore for Pool {
    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let _: () = KeysInterface::set(self, key, value, None, None, false)
            .await
            .context("KeyDB SET failed")?;
        Ok(())
    }

    async fn expire_key(&self, key: &str, seconds: i64) -> Result<()> {
        let _: bool = KeysInterface::expire(self, key, seconds, None)
            .await
            .context("KeyDB EXPIRE failed")?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = KeysInterface::get(self, key)
            .await
            .context("KeyDB GET failed")?;
        Ok(value)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = ClientLike::custom(
            self,
            CustomCommand::new_static("KEYS", None::<u16>, false),
            vec![pattern.to_string()],
        )
        .await
        .with_context(|| format!("KeyDB KEYS {pattern} failed"))?;
        Ok(keys)
    }

    async fn ping_store(&self) -> Result<()> {
        let _: String = ClientLike::ping(self, None)
            .await
            .context("KeyDB PING failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pool creation
// ---------------------------------------------------------------------------

/// Create a KeyDB connection pool from the application configuration.
///
/// A password embedded in the endpoint (`redis://:secret@host`) is sent as
/// `AUTH`; otherwise the token is read from the environment variable named in
/// `config.auth_token_env`, if set.  The pool is connected and verified with
/// a PING before being returned.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let endpoint = parse_endpoint(&config.endpoint)?;
    let password = endpoint
        .password
        .map(str::to_string)
        .or_else(|| std::env::var(&config.auth_token_env).ok());

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(endpoint.host, endpoint.port),
        ..fred::types::config::Config::default()
    };

    if config.tls || endpoint.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    fred_config.password = password;

    let mut builder = Builder::from_config(fred_config);

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;
    pool.ping_store()
        .await
        .context("KeyDB liveness probe failed after connect")?;

    tracing::info!(
        host = endpoint.host,
        port = endpoint.port,
        tls = config.tls || endpoint.tls,
        pool_size = POOL_SIZE,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Components of a `redis://` / `rediss://` endpoint.
#[derive(Debug, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub host: &'a str,
    pub port: u16,
    pub password: Option<&'a str>,
    pub tls: bool,
}

/// Parse `[redis[s]://][[user]:password@]host[:port][/db]`.  The port
/// defaults to `6379`.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint<'_>> {
    let (rest, tls) = if let Some(rest) = endpoint.strip_prefix("rediss://") {
        (rest, true)
    } else {
        (endpoint.strip_prefix("redis://").unwrap_or(endpoint), false)
    };

    // Strip any trailing path segments (e.g. a database number).
    let rest = rest.split('/').next().unwrap_or(rest);

    let (password, authority) = match rest.rsplit_once('@') {
        Some((userinfo, authority)) => {
            let password = userinfo
                .split_once(':')
                .map_or(userinfo, |(_user, password)| password);
            (Some(password).filter(|p| !p.is_empty()), authority)
        }
        None => (None, rest),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            (host, port)
        }
        None => (authority, 6379),
    };

    anyhow::ensure!(!host.is_empty(), "missing host in endpoint: {endpoint}");

    Ok(Endpoint {
        host,
        port,
        password,
        tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_with_port() {
        let ep = parse_endpoint("keydb.local:6380").unwrap();
        assert_eq!(ep.host, "keydb.local");
        assert_eq!(ep.port, 6380);
        assert_eq!(ep.password, None);
        assert!(!ep.tls);
    }

    #[test]
    fn parse_endpoint_default_port() {
        let ep = parse_endpoint("redis://keydb.local").unwrap();
        assert_eq!(ep.host, "keydb.local");
        assert_eq!(ep.port, 6379);
    }

    #[test]
    fn parse_endpoint_with_password_and_db() {
        let ep = parse_endpoint("rediss://:s3cret@keydb.local:6380/0").unwrap();
        assert_eq!(
            ep,
            Endpoint {
                host: "keydb.local",
                port: 6380,
                password: Some("s3cret"),
                tls: true,
            }
        );
    }

    #[test]
    fn parse_endpoint_user_and_password() {
        let ep = parse_endpoint("redis://default:pw@10.0.0.5").unwrap();
        assert_eq!(ep.password, Some("pw"));
        assert_eq!(ep.host, "10.0.0.5");
    }

    #[test]
    fn parse_endpoint_rejects_bad_port() {
        assert!(parse_endpoint("redis://keydb.local:notaport").is_err());
        assert!(parse_endpoint("redis://:6379").is_err());
    }
}
