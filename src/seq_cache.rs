//! Sequence cache (component C): `group -> max_seq` and `seq -> locator`.
//!
//! Two bounded, per-backend hash tables sized by memory budget (spec §6
//! `seq_cache_size_mb` / `tid_cache_size_mb`), not by entry count — both
//! must tolerate eviction at any time; correctness never depends on a hit.
//! A miss falls back to an authoritative source: a one-time scan of the
//! relation for `max_seq`, or an index probe for a locator.
//!
//! Allocation of a new `seq` is protected by the caller holding the
//! per-fingerprint advisory lock (`shmem::lock_fingerprint`) — this module
//! only tracks the *value*, not the lock.

use std::collections::HashMap;

use crate::hash::Fingerprint;

/// Opaque physical row locator — in PostgreSQL terms, an `ItemPointerData`
/// (block + offset). Recomputable on a miss via an index probe, so no
/// invariant depends on its presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLocator {
    pub block: u32,
    pub offset: u16,
}

/// Per-backend cache of `(relation, fingerprint) -> max committed seq`.
pub struct MaxSeqCache {
    table: HashMap<(u32, Fingerprint), u64>,
    budget_bytes: usize,
    approx_bytes: usize,
}

/// One entry's approximate memory cost: key + value + hash-map overhead.
const MAX_SEQ_ENTRY_COST: usize = 64;
const LOCATOR_ENTRY_COST: usize = 56;

impl MaxSeqCache {
    pub fn new(budget_mb: i32) -> Self {
        Self {
            table: HashMap::new(),
            budget_bytes: (budget_mb.max(1) as usize) * 1024 * 1024,
            approx_bytes: 0,
        }
    }

    /// Look up the cached max `seq` for a group. `None` means "not cached";
    /// the caller must fall back to a visibility-aware scan of the
    /// relation, which is always authoritative (spec §4.C: "Must be
    /// correct even if backends that allocated were killed mid-transaction").
    pub fn get(&self, relation: u32, fp: &Fingerprint) -> Option<u64> {
        self.table.get(&(relation, *fp)).copied()
    }

    /// Record (or overwrite) the max `seq` for a group, e.g. after a scan
    /// or a successful allocation.
    pub fn set(&mut self, relation: u32, fp: &Fingerprint, max_seq: u64) {
        self.evict_if_needed();
        if self.table.insert((relation, *fp), max_seq).is_none() {
            self.approx_bytes += MAX_SEQ_ENTRY_COST;
        }
    }

    /// Allocate the next `seq` for a group, returning `(new_seq,
    /// pre_allocation_max)`. The caller must hold the fingerprint's
    /// advisory lock. `pre_allocation_max` is recorded so a rolled-back
    /// INSERT can release the allocation back via `release`.
    pub fn allocate(&mut self, relation: u32, fp: &Fingerprint, authoritative_max: u64) -> Result<(u64, u64), crate::error::StrataError> {
        let current = self.get(relation, fp).unwrap_or(0).max(authoritative_max);
        let next = current
            .checked_add(1)
            .ok_or(crate::error::StrataError::SequenceOverflow(relation))?;
        self.set(relation, fp, next);
        Ok((next, current))
    }

    /// Release a seq allocation back after a rolled-back INSERT: the
    /// group's max_seq reverts to `pre_allocation_max`, but only if no
    /// other backend has since advanced it further (we never regress a
    /// max_seq another committed insert has already raised).
    pub fn release(&mut self, relation: u32, fp: &Fingerprint, allocated_seq: u64, pre_allocation_max: u64) {
        if let Some(current) = self.table.get_mut(&(relation, *fp))
            && *current == allocated_seq
        {
            *current = pre_allocation_max;
        }
    }

    /// Invalidate (drop) the cached max_seq for a group, e.g. after a
    /// DELETE cascade, forcing the next access to re-scan.
    pub fn invalidate(&mut self, relation: u32, fp: &Fingerprint) {
        if self.table.remove(&(relation, *fp)).is_some() {
            self.approx_bytes = self.approx_bytes.saturating_sub(MAX_SEQ_ENTRY_COST);
        }
    }

    /// Drop every entry for a relation (TRUNCATE).
    pub fn invalidate_relation(&mut self, relation: u32) {
        let before = self.table.len();
        self.table.retain(|(rel, _), _| *rel != relation);
        self.approx_bytes = self
            .approx_bytes
            .saturating_sub((before - self.table.len()) * MAX_SEQ_ENTRY_COST);
    }

    fn evict_if_needed(&mut self) {
        // Bounded by memory budget, not count: evict arbitrary entries
        // (recomputable on miss) until under budget. A HashMap has no
        // intrinsic recency order, so this is a simple "evict something"
        // policy — acceptable because a miss here only costs a scan, never
        // correctness.
        while self.approx_bytes + MAX_SEQ_ENTRY_COST > self.budget_bytes && !self.table.is_empty() {
            if let Some(key) = self.table.keys().next().copied() {
                self.table.remove(&key);
                self.approx_bytes = self.approx_bytes.saturating_sub(MAX_SEQ_ENTRY_COST);
            } else {
                break;
            }
        }
    }
}

/// Per-backend cache of `(relation, seq) -> physical row locator`, used so
/// the reconstruction walker can jump directly to a base row without an
/// index lookup. On eviction, nothing special happens: the walker simply
/// probes the relation's index for the base's `seq` instead.
pub struct LocatorCache {
    table: HashMap<(u32, u64), RowLocator>,
    budget_bytes: usize,
    approx_bytes: usize,
}

impl LocatorCache {
    pub fn new(budget_mb: i32) -> Self {
        Self {
            table: HashMap::new(),
            budget_bytes: (budget_mb.max(1) as usize) * 1024 * 1024,
            approx_bytes: 0,
        }
    }

    pub fn get(&self, relation: u32, seq: u64) -> Option<RowLocator> {
        self.table.get(&(relation, seq)).copied()
    }

    pub fn set(&mut self, relation: u32, seq: u64, locator: RowLocator) {
        self.evict_if_needed();
        if self.table.insert((relation, seq), locator).is_none() {
            self.approx_bytes += LOCATOR_ENTRY_COST;
        }
    }

    pub fn invalidate_from(&mut self, relation: u32, from_seq: u64) {
        let before = self.table.len();
        self.table
            .retain(|(rel, seq), _| !(*rel == relation && *seq >= from_seq));
        self.approx_bytes = self
            .approx_bytes
            .saturating_sub((before - self.table.len()) * LOCATOR_ENTRY_COST);
    }

    pub fn invalidate_relation(&mut self, relation: u32) {
        self.invalidate_from(relation, 0);
    }

    fn evict_if_needed(&mut self) {
        while self.approx_bytes + LOCATOR_ENTRY_COST > self.budget_bytes && !self.table.is_empty() {
            if let Some(key) = self.table.keys().next().copied() {
                self.table.remove(&key);
                self.approx_bytes = self.approx_bytes.saturating_sub(LOCATOR_ENTRY_COST);
            } else {
                break;
            }
        }
    }
}

// ── Per-backend global instances ────────────────────────────────────────
//
// Both tables are backend-private (spec §5 "Shared resources": "The
// sequence and stats accumulators are backend-private until flushed"), so a
// thread_local is the right home — each PostgreSQL backend process gets its
// own, and within a backend there is exactly one logical thread of
// execution driving SPI, matching the teacher's per-backend catalog cache
// pattern in `src/catalog.rs`.

thread_local! {
    static MAX_SEQ: std::cell::RefCell<Option<MaxSeqCache>> = const { std::cell::RefCell::new(None) };
    static LOCATORS: std::cell::RefCell<Option<LocatorCache>> = const { std::cell::RefCell::new(None) };
}

fn with_max_seq<R>(f: impl FnOnce(&mut MaxSeqCache) -> R) -> R {
    MAX_SEQ.with(|cell| {
        let mut guard = cell.borrow_mut();
        if guard.is_none() {
            *guard = Some(MaxSeqCache::new(crate::config::seq_cache_size_mb()));
        }
        f(guard.as_mut().unwrap())
    })
}

fn with_locators<R>(f: impl FnOnce(&mut LocatorCache) -> R) -> R {
    LOCATORS.with(|cell| {
        let mut guard = cell.borrow_mut();
        if guard.is_none() {
            *guard = Some(LocatorCache::new(crate::config::tid_cache_size_mb()));
        }
        f(guard.as_mut().unwrap())
    })
}

/// Allocate the next `seq` for a group. `authoritative_max` is the result of
/// a fallback scan the caller performs on a cache miss (spec §4.C: "a
/// visibility-aware max scan is the authoritative fallback") — pass the
/// cached value's `.unwrap_or(0)` when no scan was needed. The caller must
/// already hold the fingerprint's advisory lock.
pub fn allocate_seq(
    relation: u32,
    fp: &Fingerprint,
    authoritative_max: u64,
) -> Result<(u64, u64), crate::error::StrataError> {
    with_max_seq(|c| c.allocate(relation, fp, authoritative_max))
}

/// Cached max `seq` for a group, or `None` on a cache miss (caller must
/// fall back to an authoritative scan).
pub fn cached_max_seq(relation: u32, fp: &Fingerprint) -> Option<u64> {
    with_max_seq(|c| c.get(relation, fp))
}

pub fn release_seq(relation: u32, fp: &Fingerprint, allocated_seq: u64, pre_allocation_max: u64) {
    with_max_seq(|c| c.release(relation, fp, allocated_seq, pre_allocation_max));
}

pub fn invalidate_group(relation: u32, fp: &Fingerprint) {
    with_max_seq(|c| c.invalidate(relation, fp));
}

pub fn invalidate_relation(relation: u32) {
    with_max_seq(|c| c.invalidate_relation(relation));
    with_locators(|c| c.invalidate_relation(relation));
}

pub fn get_locator(relation: u32, seq: u64) -> Option<RowLocator> {
    with_locators(|c| c.get(relation, seq))
}

pub fn set_locator(relation: u32, seq: u64, locator: RowLocator) {
    with_locators(|c| c.set(relation, seq, locator));
}

pub fn invalidate_locators_from(relation: u32, from_seq: u64) {
    with_locators(|c| c.invalidate_from(relation, from_seq));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        let mut f = [0u8; 16];
        f[0] = byte;
        f
    }

    #[test]
    fn test_allocate_starts_at_one() {
        let mut cache = MaxSeqCache::new(16);
        let (seq, pre) = cache.allocate(1, &fp(1), 0).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pre, 0);
    }

    #[test]
    fn test_allocate_increments() {
        let mut cache = MaxSeqCache::new(16);
        cache.allocate(1, &fp(1), 0).unwrap();
        let (seq2, pre2) = cache.allocate(1, &fp(1), 0).unwrap();
        assert_eq!(seq2, 2);
        assert_eq!(pre2, 1);
    }

    #[test]
    fn test_allocate_respects_authoritative_max() {
        let mut cache = MaxSeqCache::new(16);
        // A scan found a higher max_seq than our (empty) cache knows about.
        let (seq, pre) = cache.allocate(1, &fp(1), 41).unwrap();
        assert_eq!(seq, 42);
        assert_eq!(pre, 41);
    }

    #[test]
    fn test_release_reverts_on_rollback() {
        let mut cache = MaxSeqCache::new(16);
        let (seq, pre) = cache.allocate(1, &fp(1), 0).unwrap();
        cache.release(1, &fp(1), seq, pre);
        assert_eq!(cache.get(1, &fp(1)), Some(0));
    }

    #[test]
    fn test_release_does_not_regress_past_newer_commit() {
        let mut cache = MaxSeqCache::new(16);
        let (seq1, pre1) = cache.allocate(1, &fp(1), 0).unwrap();
        // Another backend's commit raced ahead.
        cache.set(1, &fp(1), seq1 + 5);
        cache.release(1, &fp(1), seq1, pre1);
        // Our release is stale (current != allocated_seq): no-op.
        assert_eq!(cache.get(1, &fp(1)), Some(seq1 + 5));
    }

    #[test]
    fn test_sequence_overflow_is_hard_error() {
        let mut cache = MaxSeqCache::new(16);
        let err = cache.allocate(1, &fp(1), u64::MAX).unwrap_err();
        assert_eq!(err.kind(), crate::error::StrataErrorKind::Resource);
    }

    #[test]
    fn test_invalidate_relation_clears_only_that_relation() {
        let mut cache = MaxSeqCache::new(16);
        cache.set(1, &fp(1), 5);
        cache.set(2, &fp(1), 9);
        cache.invalidate_relation(1);
        assert_eq!(cache.get(1, &fp(1)), None);
        assert_eq!(cache.get(2, &fp(1)), Some(9));
    }

    #[test]
    fn test_locator_cache_invalidate_from_seq() {
        let mut cache = LocatorCache::new(16);
        cache.set(1, 1, RowLocator { block: 0, offset: 1 });
        cache.set(1, 2, RowLocator { block: 0, offset: 2 });
        cache.set(1, 3, RowLocator { block: 0, offset: 3 });
        cache.invalidate_from(1, 2);
        assert!(cache.get(1, 1).is_some());
        assert!(cache.get(1, 2).is_none());
        assert!(cache.get(1, 3).is_none());
    }
}
