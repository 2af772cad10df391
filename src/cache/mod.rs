//! Content-addressed result cache.
//!
//! Caches tool outputs to skip redundant executions when the same
//! artifact is analysed again with the same argument list.

pub mod store;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::models::OutputFiles;

pub use store::{CacheStats, ShardedStore};

/// SHA-256 digest identifying an (artifact, arguments) pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint an artifact identity followed by its ordered arguments.
    pub fn compute<I, S>(artifact_identity: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        absorb(&mut hasher, artifact_identity.as_bytes());
        for arg in args {
            absorb(&mut hasher, arg.as_ref().as_bytes());
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Length-prefix each component so boundaries are part of the digest.
fn absorb(hasher: &mut Sha256, component: &[u8]) {
    hasher.update((component.len() as u64).to_le_bytes());
    hasher.update(component);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// The cache engine for analysis results.
pub struct CacheEngine {
    enabled: bool,
    store: ShardedStore,
}

impl CacheEngine {
    /// Create a new cache engine.
    pub fn new(enabled: bool, shards: usize, ttl: Duration) -> Self {
        Self {
            enabled,
            store: ShardedStore::new(shards, ttl),
        }
    }

    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        Self::new(config.enabled, config.shards, config.ttl())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up cached outputs.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<OutputFiles>> {
        if !self.enabled {
            return None;
        }
        self.store.get(key)
    }

    /// Store outputs in the cache.
    pub fn put(&self, key: Fingerprint, outputs: impl Into<Arc<OutputFiles>>) {
        if !self.enabled {
            return;
        }
        self.store.set(key, outputs);
    }

    /// Drop a single entry.
    pub fn evict(&self, key: &Fingerprint) -> bool {
        self.store.delete(key)
    }

    /// Compute statistics about the cache.
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Periodically purge expired entries until the engine is dropped.
    ///
    /// Lookups already expire entries lazily; this only reclaims memory
    /// held by entries nobody asks for again.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let removed = engine.store.clear_expired();
                if removed > 0 {
                    tracing::debug!(removed, "cache sweep removed expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_deterministic() {
        let k1 = Fingerprint::compute("digest", ["-x", "1.21", "out.dat"]);
        let k2 = Fingerprint::compute("digest", vec!["-x".to_string(), "1.21".into(), "out.dat".into()]);
        assert_eq!(k1, k2);
        assert_eq!(k1.to_hex().len(), 64);
    }

    #[test]
    fn fingerprint_varies_with_artifact() {
        let k1 = Fingerprint::compute("digest1", ["-res"]);
        let k2 = Fingerprint::compute("digest2", ["-res"]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn fingerprint_argument_order_matters() {
        let k1 = Fingerprint::compute("d", ["-ha", "-res"]);
        let k2 = Fingerprint::compute("d", ["-res", "-ha"]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn fingerprint_component_boundaries_matter() {
        let k1 = Fingerprint::compute("d", ["ab", "c"]);
        let k2 = Fingerprint::compute("d", ["a", "bc"]);
        let k3 = Fingerprint::compute("da", ["b", "c"]);
        assert_ne!(k1, k2);
        assert_ne!(k2, k3);
    }

    #[test]
    fn display_is_hex() {
        let k = Fingerprint::compute("d", Vec::<String>::new());
        assert_eq!(k.to_string(), k.to_hex());
        assert!(format!("{k:?}").starts_with("Fingerprint("));
    }

    #[test]
    fn disabled_engine_is_pass_through() {
        let engine = CacheEngine::new(false, 4, Duration::from_secs(60));
        let key = Fingerprint::compute("d", ["-res"]);
        engine.put(key, OutputFiles::from([("a".to_string(), b"x".to_vec())]));
        assert!(engine.get(&key).is_none());
        assert_eq!(engine.stats().entries, 0);
    }

    #[test]
    fn enabled_engine_round_trips() {
        let engine = CacheEngine::new(true, 4, Duration::from_secs(60));
        let key = Fingerprint::compute("d", ["-res"]);
        engine.put(key, OutputFiles::from([("a".to_string(), b"x".to_vec())]));
        assert_eq!(engine.get(&key).unwrap()["a"], b"x");
        assert!(engine.evict(&key));
        assert!(engine.get(&key).is_none());
    }

    #[tokio::test]
    async fn sweeper_purges_expired_entries() {
        let engine = Arc::new(CacheEngine::new(true, 2, Duration::from_millis(20)));
        let key = Fingerprint::compute("d", ["-res"]);
        engine.put(key, OutputFiles::new());

        let handle = engine.spawn_sweeper(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.stats().entries, 0);

        drop(engine);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper should stop once the engine is dropped")
            .unwrap();
    }
}
