//! Shared LRU content cache (component E).
//!
//! A striped, fixed-slot cache of reconstructed column payloads, keyed by
//! `(fingerprint, seq, col_idx)`. Each of S stripes (`pg_strata.cache_partitions`)
//! independently owns a fixed-size entry array, a free-slot list, an LRU
//! doubly-linked list (by index, not pointer — this must be safe to place
//! in shared memory), and a lock. Stripe index is `fingerprint-derived hash
//! mod S`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::hash::{Fingerprint, stripe_index};

/// The cache key: fingerprint + (seq, column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub seq: u64,
    pub col_idx: u16,
}

struct Entry {
    key: CacheKey,
    bytes: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One independently-locked partition of the cache.
struct Stripe {
    entries: Vec<Option<Entry>>,
    index: HashMap<CacheKey, usize>,
    free_list: Vec<usize>,
    lru_head: Option<usize>, // most recently used
    lru_tail: Option<usize>, // least recently used
    hits: u64,
    misses: u64,
    evictions: u64,
    skips: u64,
}

impl Stripe {
    fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            index: HashMap::new(),
            free_list: (0..capacity).rev().collect(),
            lru_head: None,
            lru_tail: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            skips: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entries[idx].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entries[p].as_mut().unwrap().next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entries[n].as_mut().unwrap().prev = prev,
            None => self.lru_tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.lru_head;
        {
            let e = self.entries[idx].as_mut().unwrap();
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.entries[h].as_mut().unwrap().prev = Some(idx);
        }
        self.lru_head = Some(idx);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        self.unlink(idx);
        self.push_front(idx);
    }

    fn evict_one(&mut self) -> bool {
        let Some(tail) = self.lru_tail else { return false };
        self.unlink(tail);
        let entry = self.entries[tail].take().unwrap();
        self.index.remove(&entry.key);
        self.free_list.push(tail);
        self.evictions += 1;
        true
    }

    fn probe(&mut self, key: &CacheKey) -> Option<Vec<u8>> {
        if let Some(&idx) = self.index.get(key) {
            self.touch(idx);
            self.hits += 1;
            Some(self.entries[idx].as_ref().unwrap().bytes.clone())
        } else {
            self.misses += 1;
            None
        }
    }

    fn insert(&mut self, key: CacheKey, bytes: Vec<u8>, max_entry_bytes: usize) {
        if bytes.len() > max_entry_bytes {
            self.skips += 1;
            return;
        }
        if let Some(&idx) = self.index.get(&key) {
            self.entries[idx].as_mut().unwrap().bytes = bytes;
            self.touch(idx);
            return;
        }
        while self.free_list.is_empty() {
            if !self.evict_one() {
                // Capacity is zero; nothing to do.
                return;
            }
        }
        let idx = self.free_list.pop().unwrap();
        self.entries[idx] = Some(Entry {
            key,
            bytes,
            prev: None,
            next: None,
        });
        self.push_front(idx);
        self.index.insert(key, idx);
    }

    fn invalidate(&mut self, fp: &Fingerprint, from_seq: u64) {
        let to_remove: Vec<CacheKey> = self
            .index
            .keys()
            .filter(|k| k.fingerprint == *fp && k.seq >= from_seq)
            .copied()
            .collect();
        for key in to_remove {
            if let Some(idx) = self.index.remove(&key) {
                self.unlink(idx);
                self.entries[idx] = None;
                self.free_list.push(idx);
            }
        }
    }

    fn entry_count(&self) -> usize {
        self.index.len()
    }

    fn byte_count(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref().map(|e| e.bytes.len()))
            .sum()
    }
}

pub struct ContentCache {
    stripes: Vec<Mutex<Stripe>>,
    max_entry_bytes: usize,
}

impl ContentCache {
    pub fn new(num_stripes: usize, entries_per_stripe: usize, max_entry_bytes: usize) -> Self {
        Self {
            stripes: (0..num_stripes.max(1))
                .map(|_| Mutex::new(Stripe::new(entries_per_stripe)))
                .collect(),
            max_entry_bytes,
        }
    }

    fn stripe_for(&self, key: &CacheKey) -> &Mutex<Stripe> {
        let idx = stripe_index(&key.fingerprint, self.stripes.len());
        &self.stripes[idx]
    }

    pub fn probe(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.stripe_for(key).lock().probe(key)
    }

    pub fn insert(&self, key: CacheKey, bytes: Vec<u8>) {
        self.stripe_for(&key).lock().insert(key, bytes, self.max_entry_bytes);
    }

    /// Drop all entries for `relation`'s group `fp` with `seq >= from_seq`.
    /// Relation scoping is implicit in the fingerprint/seq pair since a
    /// relation's fingerprints are computed independently per relation by
    /// the caller (the storage layer always passes a relation-qualified
    /// fingerprint derivation upstream); stripes are scanned directly
    /// because invalidation is rare relative to probes.
    pub fn invalidate(&self, fp: &Fingerprint, from_seq: u64) {
        let idx = stripe_index(fp, self.stripes.len());
        self.stripes[idx].lock().invalidate(fp, from_seq);
    }

    pub fn invalidate_all_stripes(&self, fp: &Fingerprint, from_seq: u64) {
        for stripe in &self.stripes {
            stripe.lock().invalidate(fp, from_seq);
        }
    }

    pub fn aggregate_stats(&self) -> crate::shmem::ContentCacheGlobalStats {
        let mut out = crate::shmem::ContentCacheGlobalStats::default();
        for stripe in &self.stripes {
            let s = stripe.lock();
            out.hits += s.hits;
            out.misses += s.misses;
            out.evictions += s.evictions;
            out.skips += s.skips;
            out.entries += s.entry_count() as u64;
            out.bytes += s.byte_count() as u64;
        }
        out
    }
}

static GLOBAL: Mutex<Option<ContentCache>> = Mutex::new(None);

pub fn request_shared_memory() {
    let _ = crate::shmem::content_cache_arena_bytes();
}

fn with_cache<R>(f: impl FnOnce(&ContentCache) -> R) -> R {
    let mut guard = GLOBAL.lock();
    if guard.is_none() {
        let slot_bytes = (crate::config::cache_slot_size_kb().max(1) as usize) * 1024;
        let total_bytes = crate::shmem::content_cache_arena_bytes().max(slot_bytes);
        let num_stripes = crate::config::cache_partitions().max(1) as usize;
        let entries_per_stripe =
            ((total_bytes / slot_bytes).max(1) / num_stripes.max(1)).max(1);
        let max_entry_bytes = (crate::config::cache_max_entry_kb().max(1) as usize) * 1024;
        *guard = Some(ContentCache::new(num_stripes, entries_per_stripe, max_entry_bytes));
    }
    f(guard.as_ref().unwrap())
}

pub fn probe(key: &CacheKey) -> Option<Vec<u8>> {
    with_cache(|c| c.probe(key))
}

pub fn insert(key: CacheKey, bytes: Vec<u8>) {
    with_cache(|c| c.insert(key, bytes));
    if crate::shmem::is_shmem_available() {
        let snapshot = with_cache(|c| c.aggregate_stats());
        *crate::shmem::CONTENT_CACHE_STATS.exclusive() = snapshot;
    }
}

pub fn invalidate(fp: &Fingerprint, from_seq: u64) {
    with_cache(|c| c.invalidate_all_stripes(fp, from_seq));
}

pub fn stats_snapshot() -> crate::shmem::ContentCacheGlobalStats {
    with_cache(|c| c.aggregate_stats())
}

pub fn is_shared_available() -> bool {
    crate::shmem::is_shmem_available()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(b: u8) -> Fingerprint {
        let mut f = [0u8; 16];
        f[0] = b;
        f
    }

    fn key(f: u8, seq: u64, col: u16) -> CacheKey {
        CacheKey {
            fingerprint: fp(f),
            seq,
            col_idx: col,
        }
    }

    #[test]
    fn test_probe_miss_then_insert_then_hit() {
        let cache = ContentCache::new(1, 8, 1024);
        assert!(cache.probe(&key(1, 1, 0)).is_none());
        cache.insert(key(1, 1, 0), b"hello".to_vec());
        assert_eq!(cache.probe(&key(1, 1, 0)), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_oversized_entry_is_skipped() {
        let cache = ContentCache::new(1, 8, 4);
        cache.insert(key(1, 1, 0), b"too big".to_vec());
        assert!(cache.probe(&key(1, 1, 0)).is_none());
        assert_eq!(cache.aggregate_stats().skips, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = ContentCache::new(1, 2, 1024);
        cache.insert(key(1, 1, 0), b"a".to_vec());
        cache.insert(key(1, 2, 0), b"b".to_vec());
        // touch seq=1 so seq=2 becomes the LRU tail.
        cache.probe(&key(1, 1, 0));
        cache.insert(key(1, 3, 0), b"c".to_vec());
        assert!(cache.probe(&key(1, 2, 0)).is_none());
        assert!(cache.probe(&key(1, 1, 0)).is_some());
        assert!(cache.probe(&key(1, 3, 0)).is_some());
    }

    #[test]
    fn test_invalidate_drops_matching_seqs_only() {
        let cache = ContentCache::new(1, 8, 1024);
        cache.insert(key(1, 1, 0), b"a".to_vec());
        cache.insert(key(1, 2, 0), b"b".to_vec());
        cache.insert(key(1, 3, 0), b"c".to_vec());
        cache.invalidate_all_stripes(&fp(1), 2);
        assert!(cache.probe(&key(1, 1, 0)).is_some());
        assert!(cache.probe(&key(1, 2, 0)).is_none());
        assert!(cache.probe(&key(1, 3, 0)).is_none());
    }

    #[test]
    fn test_different_fingerprints_independent() {
        let cache = ContentCache::new(4, 8, 1024);
        cache.insert(key(1, 1, 0), b"a".to_vec());
        cache.insert(key(2, 1, 0), b"b".to_vec());
        cache.invalidate_all_stripes(&fp(1), 0);
        assert!(cache.probe(&key(1, 1, 0)).is_none());
        assert!(cache.probe(&key(2, 1, 0)).is_some());
    }

    #[test]
    fn test_aggregate_stats_sum_across_stripes() {
        let cache = ContentCache::new(4, 8, 1024);
        for i in 0..10u8 {
            cache.insert(key(i, 1, 0), b"x".to_vec());
        }
        let stats = cache.aggregate_stats();
        assert_eq!(stats.entries, 10);
    }
}
