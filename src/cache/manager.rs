//! L1 + L2 cache with tag-indexed invalidation.

use crate::backend::{DistributedStore, MetricsSink};
use crate::config::CacheSettings;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ENTRY_PREFIX: &str = "cache:entry:";
const TAG_PREFIX: &str = "cache:tag:";

fn entry_key(key: &str) -> String {
    format!("{ENTRY_PREFIX}{key}")
}

fn tag_key(tag: &str) -> String {
    format!("{TAG_PREFIX}{tag}")
}

/// Wire format for L2 entries; tags travel with the value so an L2 hit can
/// repopulate L1 including its tag index.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    tags: Vec<String>,
}

struct L1Entry {
    value: Value,
    tags: Vec<String>,
    expires_at: Instant,
}

struct L1State {
    entries: LruCache<String, L1Entry>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl L1State {
    fn index_tags(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn insert(&mut self, key: String, entry: L1Entry) {
        let tags = entry.tags.clone();
        if let Some((evicted_key, evicted)) = self.entries.push(key.clone(), entry) {
            // push returns the displaced entry: either the LRU victim or the
            // previous value under the same key.
            if evicted_key != key {
                let evicted_tags = evicted.tags;
                self.unindex(&evicted_key, &evicted_tags);
            }
        }
        self.index_tags(&key, &tags);
    }
}

/// Two-tier cache facade. The L1 critical section never spans I/O; L2 calls
/// happen with no lock held.
pub struct CacheManager {
    settings: CacheSettings,
    l1: Mutex<L1State>,
    l2: Arc<dyn DistributedStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl CacheManager {
    pub fn new(
        settings: CacheSettings,
        l2: Arc<dyn DistributedStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let capacity = NonZeroUsize::new(settings.l1_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            settings,
            l1: Mutex::new(L1State {
                entries: LruCache::new(capacity),
                tag_index: HashMap::new(),
            }),
            l2,
            metrics,
        }
    }

    /// Look a key up in L1 then L2. `None` tells the caller to fetch from
    /// the database and `set` the result.
    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let mut l1 = self.l1.lock();
            match l1.entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    self.metrics
                        .incr_counter("cache_hits", 1, &[("tier", "l1".to_string())]);
                    return Some(entry.value.clone());
                }
                Some(_) => {
                    // Expired: drop it so the L2 answer repopulates cleanly.
                    if let Some(entry) = l1.entries.pop(key) {
                        let tags = entry.tags;
                        l1.unindex(key, &tags);
                    }
                }
                None => {}
            }
        }

        match self.l2.get(&entry_key(key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredEntry>(&raw) {
                Ok(stored) => {
                    self.metrics
                        .incr_counter("cache_hits", 1, &[("tier", "l2".to_string())]);
                    self.populate_l1(key, stored.value.clone(), &stored.tags);
                    Some(stored.value)
                }
                Err(e) => {
                    warn!(key, error = %e, "undecodable L2 entry, treating as miss");
                    None
                }
            },
            Ok(None) => {
                self.metrics.incr_counter("cache_misses", 1, &[]);
                None
            }
            Err(e) => {
                // Fail open: a cache outage degrades to a database read.
                warn!(key, error = %e, "L2 get failed, falling through to source");
                self.metrics.incr_counter("cache_l2_errors", 1, &[]);
                None
            }
        }
    }

    /// Write to both tiers and index the key under each tag. L2 failures
    /// are logged, never surfaced.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>, tags: &[String]) {
        self.populate_l1(key, value.clone(), tags);

        let ttl = ttl.unwrap_or_else(|| self.settings.l2_ttl());
        let stored = StoredEntry {
            value,
            tags: tags.to_vec(),
        };
        let raw = match serde_json::to_string(&stored) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "unserializable cache value, skipping L2 write");
                return;
            }
        };
        if let Err(e) = self.l2.set(&entry_key(key), &raw, Some(ttl)).await {
            warn!(key, error = %e, "L2 set failed, entry is L1-only");
            self.metrics.incr_counter("cache_l2_errors", 1, &[]);
            return;
        }
        for tag in tags {
            if let Err(e) = self.l2.add_to_set(&tag_key(tag), key).await {
                warn!(key, tag, error = %e, "L2 tag index update failed");
                self.metrics.incr_counter("cache_l2_errors", 1, &[]);
            }
        }
    }

    /// Remove every key associated with any of `tags` from both tiers.
    /// Returns the number of distinct keys invalidated.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let mut keys: HashSet<String> = HashSet::new();

        {
            let mut l1 = self.l1.lock();
            for tag in tags {
                if let Some(tagged) = l1.tag_index.remove(tag) {
                    keys.extend(tagged);
                }
            }
        }

        for tag in tags {
            match self.l2.set_members(&tag_key(tag)).await {
                Ok(members) => keys.extend(members),
                Err(e) => {
                    warn!(tag, error = %e, "L2 tag lookup failed during invalidation");
                    self.metrics.incr_counter("cache_l2_errors", 1, &[]);
                }
            }
        }

        {
            let mut l1 = self.l1.lock();
            for key in &keys {
                if let Some(entry) = l1.entries.pop(key) {
                    let entry_tags = entry.tags;
                    l1.unindex(key, &entry_tags);
                }
            }
        }

        let mut to_delete: Vec<String> = keys.iter().map(|k| entry_key(k)).collect();
        to_delete.extend(tags.iter().map(|t| tag_key(t)));
        if let Err(e) = self.l2.delete(&to_delete).await {
            warn!(error = %e, "L2 delete failed during invalidation");
            self.metrics.incr_counter("cache_l2_errors", 1, &[]);
        }

        debug!(invalidated = keys.len(), ?tags, "cache invalidation completed");
        self.metrics
            .incr_counter("cache_invalidations", keys.len() as u64, &[]);
        keys.len()
    }

    fn populate_l1(&self, key: &str, value: Value, tags: &[String]) {
        let entry = L1Entry {
            value,
            tags: tags.to_vec(),
            expires_at: Instant::now() + self.settings.l1_ttl(),
        };
        self.l1.lock().insert(key.to_string(), entry);
    }

    /// Current L1 occupancy, for gauges and tests.
    pub fn l1_len(&self) -> usize {
        self.l1.lock().entries.len()
    }
}
