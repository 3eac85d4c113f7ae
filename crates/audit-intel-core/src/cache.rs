//! Reference-counted embedding cache.
//!
//! Maps a chunk fingerprint (SHA-256 of its embedding context) to the vector
//! produced for it and the model that produced it. The cache is an explicit
//! value shared behind an `Arc`, handed to the embedding pipeline and the
//! lifecycle manager.
//!
//! # Reference counting
//!
//! Every chunk occurrence of an ingested (or ingesting) document holds one
//! reference on its fingerprint. References are taken with a *pinned*
//! [`lookup`](EmbeddingCache::lookup) or [`insert`](EmbeddingCache::insert)
//! and given back with [`release`](EmbeddingCache::release), which evicts the
//! entry once nothing references it. [`unpin`](EmbeddingCache::unpin) gives a
//! reference back without evicting, so vectors computed by a failed batch
//! call can still serve the resubmission.
//!
//! Unpinned entries (query-side memoization, leftovers of failed ingestions)
//! sit at zero references until [`sweep`](EmbeddingCache::sweep) removes them.
//!
//! # Model checks
//!
//! A hit requires the entry's model id to equal the requesting model.
//! Otherwise the lookup counts as a miss and the next insert replaces the
//! vector, so embeddings from different models never mix.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

#[derive(Debug, Clone)]
struct Entry {
    vector: Vec<f32>,
    model: String,
    refs: usize,
}

/// Counters reported by [`EmbeddingCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found the fingerprint under a different model.
    /// Also counted in `misses`.
    pub model_mismatches: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    stats: CacheStats,
}

/// Process-wide embedding cache keyed by chunk fingerprint.
#[derive(Default)]
pub struct EmbeddingCache {
    table: Mutex<Table>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // Every mutation below completes before it can panic, so a
        // poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up the vector for `fingerprint` under `model`.
    ///
    /// With `pin`, a hit also takes one reference on the entry.
    pub fn lookup(&self, fingerprint: &str, model: &str, pin: bool) -> Option<Vec<f32>> {
        let mut table = self.table();
        let Table { entries, stats } = &mut *table;
        match entries.get_mut(fingerprint) {
            Some(entry) if entry.model == model => {
                stats.hits += 1;
                if pin {
                    entry.refs += 1;
                }
                Some(entry.vector.clone())
            }
            Some(_) => {
                stats.misses += 1;
                stats.model_mismatches += 1;
                None
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Store a freshly computed vector.
    ///
    /// An existing entry for the same model keeps its vector (the provider is
    /// deterministic, so both are equal); one from another model is replaced
    /// while its reference count is kept. With `pin`, one reference is taken.
    pub fn insert(&self, fingerprint: &str, model: &str, vector: Vec<f32>, pin: bool) {
        let mut table = self.table();
        let entry = table
            .entries
            .entry(fingerprint.to_string())
            .or_insert_with(|| Entry {
                vector: Vec::new(),
                model: String::new(),
                refs: 0,
            });
        if entry.model != model || entry.vector.is_empty() {
            entry.vector = vector;
            entry.model = model.to_string();
        }
        if pin {
            entry.refs += 1;
        }
    }

    /// Drop one reference; evicts the entry when none remain.
    ///
    /// Returns `true` if the entry was evicted.
    pub fn release(&self, fingerprint: &str) -> bool {
        let mut table = self.table();
        let evict = match table.entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if evict {
            table.entries.remove(fingerprint);
            table.stats.evictions += 1;
        }
        evict
    }

    /// [`release`](Self::release) every fingerprint in `fingerprints`,
    /// once per occurrence. Returns the number of evicted entries.
    pub fn release_all<'a, I>(&self, fingerprints: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        fingerprints
            .into_iter()
            .filter(|fp| self.release(fp))
            .count()
    }

    /// Drop one reference without evicting.
    pub fn unpin(&self, fingerprint: &str) {
        if let Some(entry) = self.table().entries.get_mut(fingerprint) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Evict every entry with no references. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut table = self.table();
        let before = table.entries.len();
        table.entries.retain(|_, entry| entry.refs > 0);
        let removed = before - table.entries.len();
        table.stats.evictions += removed as u64;
        removed
    }

    /// Current reference count of `fingerprint`, if cached.
    pub fn refs(&self, fingerprint: &str) -> Option<usize> {
        self.table().entries.get(fingerprint).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table();
        CacheStats {
            entries: table.entries.len(),
            ..table.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = EmbeddingCache::new();
        assert!(cache.lookup("fp", "m1", false).is_none());
        cache.insert("fp", "m1", vec![1.0, 2.0], false);
        assert_eq!(cache.lookup("fp", "m1", false), Some(vec![1.0, 2.0]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn other_model_is_a_miss_and_gets_replaced() {
        let cache = EmbeddingCache::new();
        cache.insert("fp", "old-model", vec![1.0], true);

        assert!(cache.lookup("fp", "new-model", false).is_none());
        assert_eq!(cache.stats().model_mismatches, 1);

        cache.insert("fp", "new-model", vec![9.0], true);
        assert_eq!(cache.lookup("fp", "new-model", false), Some(vec![9.0]));
        assert!(cache.lookup("fp", "old-model", false).is_none());
        assert_eq!(cache.refs("fp"), Some(2));
    }

    #[test]
    fn release_evicts_at_zero() {
        let cache = EmbeddingCache::new();
        cache.insert("fp", "m", vec![0.5], true);
        assert!(cache.lookup("fp", "m", true).is_some());
        assert_eq!(cache.refs("fp"), Some(2));

        assert!(!cache.release("fp"));
        assert_eq!(cache.refs("fp"), Some(1));
        assert!(cache.release("fp"));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
        assert!(!cache.release("fp"));
    }

    #[test]
    fn unpin_keeps_entry_for_resubmission() {
        let cache = EmbeddingCache::new();
        cache.insert("fp", "m", vec![0.5], true);
        cache.unpin("fp");
        assert_eq!(cache.refs("fp"), Some(0));
        assert_eq!(cache.lookup("fp", "m", false), Some(vec![0.5]));
    }

    #[test]
    fn sweep_removes_only_unreferenced() {
        let cache = EmbeddingCache::new();
        cache.insert("kept", "m", vec![1.0], true);
        cache.insert("loose", "m", vec![2.0], false);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("kept", "m", false).is_some());
    }

    #[test]
    fn release_all_counts_each_occurrence() {
        let cache = EmbeddingCache::new();
        cache.insert("a", "m", vec![1.0], true);
        cache.insert("a", "m", vec![1.0], true);
        cache.insert("b", "m", vec![2.0], true);
        assert_eq!(cache.release_all(["a", "a", "b"]), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn shared_fingerprint_survives_one_release() {
        let cache = EmbeddingCache::new();
        cache.insert("shared", "m", vec![1.0], true);
        assert!(cache.lookup("shared", "m", true).is_some());
        cache.release("shared");
        assert_eq!(cache.lookup("shared", "m", false), Some(vec![1.0]));
    }
}
