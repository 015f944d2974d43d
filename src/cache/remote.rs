//! KeyDB-backed mapping cache.
//!
//! Each entry is stored as JSON under `cacheitem:<sha256(import_path)>` and
//! given a TTL with a separate `EXPIRE` right after the `SET`.  Listing runs
//! `KEYS cacheitem:*` and fetches every key.  Store failures are logged and
//! only affect the entry at hand; the cache stays usable.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use prometheus_client::metrics::counter::Counter;
use tracing::{trace, warn};

use super::store::KeyValueStore;
use super::{EntryStream, MappingCache, MappingEntry};

/// Namespace for mapping keys.
pub const KEY_PREFIX: &str = "cacheitem:";

pub struct RemoteCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Mutex<Duration>,
    errors: Counter,
}

impl RemoteCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl: Mutex::new(Duration::ZERO),
            errors: Counter::default(),
        }
    }

    /// Count backend failures on `counter` (usually a registered metric).
    pub fn with_error_counter(mut self, counter: Counter) -> Self {
        self.errors = counter;
        self
    }

    fn ttl(&self) -> Duration {
        *self.ttl.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Storage key for `entry`.
pub fn entry_key(entry: &MappingEntry) -> String {
    format!("{KEY_PREFIX}{}", entry.hash())
}

#[async_trait::async_trait]
impl MappingCache for RemoteCache {
    async fn add(&self, entry: MappingEntry) {
        let key = entry_key(&entry);
        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                self.errors.inc();
                warn!(error = %e, import_path = %entry.import_path, "could not encode mapping");
                return;
            }
        };

        if let Err(e) = self.store.set_value(&key, &payload).await {
            self.errors.inc();
            warn!(error = %e, %key, "could not store mapping");
            return;
        }

        // EXPIRE 0 would delete the key outright; sub-second TTLs round up.
        let seconds = i64::try_from(self.ttl().as_secs().max(1)).unwrap_or(i64::MAX);
        if let Err(e) = self.store.expire_key(&key, seconds).await {
            self.errors.inc();
            warn!(error = %e, %key, "could not set mapping expiry");
            return;
        }

        trace!(%key, seconds, "mapping recorded");
    }

    fn iter(&self) -> EntryStream {
        let store = Arc::clone(&self.store);
        let errors = self.errors.clone();
        let pattern = format!("{KEY_PREFIX}*");

        let keys = {
            let store = Arc::clone(&store);
            let errors = errors.clone();
            async move {
                match store.list_keys(&pattern).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        errors.inc();
                        warn!(error = %e, "could not list mapping keys");
                        Vec::new()
                    }
                }
            }
        };

        stream::once(keys)
            .flat_map(stream::iter)
            .filter_map(move |key| {
                let store = Arc::clone(&store);
                let errors = errors.clone();
                async move {
                    let value = match store.get_value(&key).await {
                        Ok(Some(value)) => value,
                        // Expired between KEYS and GET.
                        Ok(None) => return None,
                        Err(e) => {
                            errors.inc();
                            warn!(error = %e, %key, "could not fetch mapping");
                            return None;
                        }
                    };
                    match serde_json::from_str::<MappingEntry>(&value) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            errors.inc();
                            warn!(error = %e, %key, "could not decode mapping");
                            None
                        }
                    }
                }
            })
            .boxed()
    }

    fn set_expiry_duration(&self, ttl: Duration) {
        *self.ttl.lock().unwrap_or_else(PoisonError::into_inner) = ttl;
    }

    fn backend(&self) -> &'static str {
        "keydb"
    }
}
