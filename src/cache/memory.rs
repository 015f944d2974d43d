//! In-process mapping cache.
//!
//! Entries live in a mutex-guarded map.  Expiry is tracked in a min-heap of
//! `(deadline, import_path)` pairs rather than one timer per insert: expired
//! entries are dropped lazily whenever the map is read and periodically by a
//! background sweeper.  A heap item only removes its key when the stored
//! deadline has also passed, so a later `add` always outlives earlier ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{EntryStream, MappingCache, MappingEntry};

/// Deadline offset used when `now + ttl` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct Slot {
    repo_location: String,
    expires_at: Instant,
}

struct Inner {
    ttl: Duration,
    entries: HashMap<String, Slot>,
    expiries: BinaryHeap<Reverse<(Instant, String)>>,
}

impl Inner {
    /// Drop every entry whose deadline is at or before `now`.  Returns the
    /// number of entries removed.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(Reverse((deadline, _))) = self.expiries.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, key))) = self.expiries.pop() else {
                break;
            };
            // Superseded heap items point at a slot with a later deadline.
            if self
                .entries
                .get(&key)
                .is_some_and(|slot| slot.expires_at <= now)
            {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ttl,
                entries: HashMap::new(),
                expiries: BinaryHeap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        inner.entries.len()
    }

    /// Drop expired entries now.
    pub fn sweep(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Periodically sweep expired entries until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!("mapping cache dropped; sweeper exiting");
                    return;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, "swept expired mappings");
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl MappingCache for MemoryCache {
    async fn add(&self, entry: MappingEntry) {
        let mut inner = self.lock();
        let now = Instant::now();
        let expires_at = now
            .checked_add(inner.ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);
        inner
            .expiries
            .push(Reverse((expires_at, entry.import_path.clone())));
        trace!(import_path = %entry.import_path, "mapping recorded");
        inner.entries.insert(
            entry.import_path,
            Slot {
                repo_location: entry.repo_location,
                expires_at,
            },
        );
    }

    fn iter(&self) -> EntryStream {
        let snapshot: Vec<MappingEntry> = {
            let mut inner = self.lock();
            inner.purge_expired(Instant::now());
            inner
                .entries
                .iter()
                .map(|(import_path, slot)| {
                    MappingEntry::new(import_path.clone(), slot.repo_location.clone())
                })
                .collect()
        };
        stream::iter(snapshot).boxed()
    }

    fn set_expiry_duration(&self, ttl: Duration) {
        self.lock().ttl = ttl;
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
