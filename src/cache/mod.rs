//! Import-path mapping cache.
//!
//! Records which vanity import paths have been requested recently and which
//! pinned repository location each one resolves to.  Two interchangeable
//! backends implement [`MappingCache`]: an in-process map ([`MemoryCache`])
//! and a KeyDB/Redis-backed store ([`RemoteCache`]).  The cache is built once
//! at startup and handed to the request handlers through `AppState`.

pub mod memory;
pub mod remote;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use prometheus_client::metrics::counter::Counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;

pub use memory::MemoryCache;
pub use remote::RemoteCache;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One import path and the location it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub import_path: String,
    #[serde(rename = "repo_url")]
    pub repo_location: String,
}

impl MappingEntry {
    pub fn new(import_path: impl Into<String>, repo_location: impl Into<String>) -> Self {
        Self {
            import_path: import_path.into(),
            repo_location: repo_location.into(),
        }
    }

    /// Hex SHA-256 of the import path.  The repo location does not take part,
    /// so re-recording an import path always lands on the same key.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.import_path.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Lazily produced sequence of live entries.
pub type EntryStream = BoxStream<'static, MappingEntry>;

/// Keyed store of import-path mappings with per-entry expiry.
#[async_trait::async_trait]
pub trait MappingCache: Send + Sync {
    /// Insert or replace `entry` and (re)start its expiry.
    async fn add(&self, entry: MappingEntry);

    /// All entries that are live at the time of the call, in no particular
    /// order.  Each call starts a fresh sequence.
    fn iter(&self) -> EntryStream;

    /// TTL applied to subsequent [`add`](Self::add) calls.
    fn set_expiry_duration(&self, ttl: Duration);

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build the cache selected by the configuration: KeyDB when a pool is
/// supplied, the in-process map otherwise.
///
/// Must be called from within the tokio runtime; the in-process cache spawns
/// its expiry sweeper here.
pub fn build_cache(
    config: &CacheConfig,
    keydb: Option<fred::clients::Pool>,
    backend_errors: Counter,
) -> Arc<dyn MappingCache> {
    let ttl = Duration::from_secs(config.ttl);
    match keydb {
        Some(pool) => {
            let cache = RemoteCache::new(Arc::new(pool)).with_error_counter(backend_errors);
            cache.set_expiry_duration(ttl);
            Arc::new(cache)
        }
        None => {
            let cache = Arc::new(MemoryCache::new(ttl));
            cache.spawn_sweeper(Duration::from_secs(config.sweep_interval));
            cache
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_repo_location() {
        let mut entry = MappingEntry::new("github.com/acme/widgets/0123456789abcdef0123456789abcdef01234567", "");
        let before = entry.hash();
        entry.repo_location = "SomeUrl".to_string();
        assert_eq!(entry.hash(), before);
    }

    #[test]
    fn hash_is_sha256_of_import_path() {
        let entry = MappingEntry::new("", "anything");
        assert_eq!(
            entry.hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(MappingEntry::new("a", "x").hash(), MappingEntry::new("b", "x").hash());
    }

    #[test]
    fn serialized_field_names() {
        let entry = MappingEntry::new("github.com/o/r/h", "/github.com/o/r/h");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"import_path":"github.com/o/r/h","repo_url":"/github.com/o/r/h"}"#
        );
    }
}
