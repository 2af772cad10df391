//! Sharded in-memory store.
//!
//! The key space is split into independently locked shards so that
//! lookups for unrelated fingerprints never contend. Expiry is lazy:
//! an entry older than the TTL is removed by the lookup that finds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::Fingerprint;
use crate::models::OutputFiles;

/// One cached result set.
struct CacheEntry {
    outputs: Arc<OutputFiles>,
    created_at: Instant,
    hits: AtomicU64,
}

/// A partition of the key space with its own lock.
#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

/// Sharded, TTL-bounded map from fingerprint to output files.
pub struct ShardedStore {
    shards: Box<[Shard]>,
    ttl: Duration,
}

impl ShardedStore {
    /// Create a store with `shard_count` shards (at least one).
    ///
    /// A zero `ttl` disables expiry.
    pub fn new(shard_count: usize, ttl: Duration) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Shard::default()).collect();
        Self { shards, ttl }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`. Pure function of the key.
    pub fn shard_index(&self, key: &Fingerprint) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&key.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &Fingerprint) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(entry.created_at) > self.ttl
    }

    /// Look up `key`, counting a hit on success.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<OutputFiles>> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &Fingerprint, now: Instant) -> Option<Arc<OutputFiles>> {
        let shard = self.shard(key);
        {
            let Ok(entries) = shard.entries.read() else {
                tracing::warn!(fingerprint = %key, "cache shard unavailable, treating as miss");
                return None;
            };
            let entry = entries.get(key)?;
            if !self.is_expired(entry, now) {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.outputs));
            }
        }

        // Expired: take the write lock and re-check, a concurrent `set`
        // may have replaced the entry in between.
        if let Ok(mut entries) = shard.entries.write() {
            if entries.get(key).is_some_and(|e| self.is_expired(e, now)) {
                entries.remove(key);
                tracing::debug!(fingerprint = %key, "evicted expired cache entry");
            }
        }
        None
    }

    /// Insert or replace the whole entry for `key`.
    pub fn set(&self, key: Fingerprint, outputs: impl Into<Arc<OutputFiles>>) {
        self.set_at(key, outputs, Instant::now());
    }

    pub(crate) fn set_at(
        &self,
        key: Fingerprint,
        outputs: impl Into<Arc<OutputFiles>>,
        now: Instant,
    ) {
        let Ok(mut entries) = self.shard(&key).entries.write() else {
            tracing::warn!(fingerprint = %key, "cache shard unavailable, skipping write");
            return;
        };
        entries.insert(
            key,
            CacheEntry {
                outputs: outputs.into(),
                created_at: now,
                hits: AtomicU64::new(0),
            },
        );
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &Fingerprint) -> bool {
        match self.shard(key).entries.write() {
            Ok(mut entries) => entries.remove(key).is_some(),
            Err(_) => false,
        }
    }

    /// Entry count and accumulated hits across all readable shards.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in self.shards.iter() {
            let Ok(entries) = shard.entries.read() else {
                continue;
            };
            stats.entries += entries.len();
            stats.total_hits += entries
                .values()
                .map(|e| e.hits.load(Ordering::Relaxed))
                .sum::<u64>();
        }
        stats
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn clear_expired(&self) -> usize {
        self.clear_expired_at(Instant::now())
    }

    pub(crate) fn clear_expired_at(&self, now: Instant) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut removed = 0;
        for shard in self.shards.iter() {
            let Ok(mut entries) = shard.entries.write() else {
                continue;
            };
            let before = entries.len();
            entries.retain(|_, e| !self.is_expired(e, now));
            removed += before - entries.len();
        }
        removed
    }
}

/// Statistics about the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Number of live entries.
    pub entries: usize,
    /// Sum of hit counters over live entries.
    pub total_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn outputs(name: &str, body: &[u8]) -> OutputFiles {
        let mut map = OutputFiles::new();
        map.insert(name.to_string(), body.to_vec());
        map
    }

    fn key(n: u32) -> Fingerprint {
        Fingerprint::compute(&format!("artifact-{n}"), ["-res", "output.res"])
    }

    #[test]
    fn set_then_get_returns_value() {
        let store = ShardedStore::new(4, Duration::from_secs(60));
        store.set(key(1), outputs("output.res", b"pores"));

        let got = store.get(&key(1)).unwrap();
        assert_eq!(got.get("output.res").unwrap(), b"pores");
        assert!(store.get(&key(2)).is_none());
    }

    #[test]
    fn set_overwrites_whole_entry() {
        let store = ShardedStore::new(4, Duration::from_secs(60));
        let mut first = outputs("a", b"1");
        first.insert("b".into(), b"2".to_vec());
        store.set(key(1), first);
        store.set(key(1), outputs("c", b"3"));

        let got = store.get(&key(1)).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got.contains_key("c"));
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let ttl = Duration::from_secs(10);
        let store = ShardedStore::new(4, ttl);
        let t0 = Instant::now();
        store.set_at(key(1), outputs("a", b"x"), t0);
        assert_eq!(store.stats().entries, 1);

        assert!(store.get_at(&key(1), t0 + ttl).is_some(), "boundary is still live");
        assert!(store.get_at(&key(1), t0 + ttl + Duration::from_millis(1)).is_none());
        assert_eq!(store.stats().entries, 0);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let store = ShardedStore::new(2, Duration::ZERO);
        let t0 = Instant::now();
        store.set_at(key(1), outputs("a", b"x"), t0);
        assert!(store.get_at(&key(1), t0 + Duration::from_secs(86_400)).is_some());
        assert_eq!(store.clear_expired_at(t0 + Duration::from_secs(86_400)), 0);
    }

    #[test]
    fn hits_are_counted() {
        let store = ShardedStore::new(4, Duration::from_secs(60));
        store.set(key(1), outputs("a", b"x"));
        store.set(key(2), outputs("a", b"y"));
        for _ in 0..3 {
            store.get(&key(1));
        }
        store.get(&key(2));
        store.get(&key(3));

        assert_eq!(
            store.stats(),
            CacheStats {
                entries: 2,
                total_hits: 4
            }
        );
    }

    #[test]
    fn delete_removes_entry() {
        let store = ShardedStore::new(4, Duration::from_secs(60));
        store.set(key(1), outputs("a", b"x"));
        assert!(store.delete(&key(1)));
        assert!(!store.delete(&key(1)));
        assert!(store.get(&key(1)).is_none());
    }

    #[test]
    fn clear_expired_sweeps_all_shards() {
        let ttl = Duration::from_secs(5);
        let store = ShardedStore::new(8, ttl);
        let t0 = Instant::now();
        for n in 0..20 {
            store.set_at(key(n), outputs("a", b"x"), t0);
        }
        store.set_at(key(100), outputs("a", b"fresh"), t0 + ttl);

        assert_eq!(store.clear_expired_at(t0 + ttl + Duration::from_secs(1)), 20);
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        let store = ShardedStore::new(7, Duration::from_secs(1));
        for n in 0..50 {
            let idx = store.shard_index(&key(n));
            assert!(idx < 7);
            assert_eq!(idx, store.shard_index(&key(n)));
        }
        assert_eq!(ShardedStore::new(0, Duration::ZERO).shard_count(), 1);
    }

    #[test]
    fn held_shard_lock_does_not_block_other_shards() {
        let store = Arc::new(ShardedStore::new(16, Duration::from_secs(60)));
        let a = key(0);
        let b = (1..)
            .map(key)
            .find(|k| store.shard_index(k) != store.shard_index(&a))
            .unwrap();

        // Simulate a long-running writer on `a`'s shard.
        let guard = store.shards[store.shard_index(&a)].entries.write().unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.set(b, outputs("a", b"other shard"));
                let found = store.get(&b).is_some();
                tx.send(found).unwrap();
            })
        };

        let found = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("operation on another shard blocked");
        assert!(found);
        drop(guard);
        worker.join().unwrap();
    }

    #[test]
    fn poisoned_shard_degrades_to_pass_through() {
        let store = Arc::new(ShardedStore::new(1, Duration::from_secs(60)));
        store.set(key(1), outputs("a", b"x"));

        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.shards[0].entries.write().unwrap();
            panic!("poison the shard");
        })
        .join();

        assert!(store.get(&key(1)).is_none());
        store.set(key(2), outputs("a", b"y"));
        assert!(!store.delete(&key(1)));
        assert_eq!(store.stats(), CacheStats::default());
    }
}
