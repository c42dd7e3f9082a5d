//! Shared-memory arena backing the advisory fingerprint lock table (§5),
//! the shared LRU content cache (component E), and the insert cache
//! (component D).
//!
//! Everything here is allocated once, at `_PG_init()` time, sized from GUCs
//! (spec §6 "Tunables"): size and slot counts are fixed for the process
//! lifetime, matching spec §5's "Shared resources" requirement. When the
//! extension is not loaded via `shared_preload_libraries`, none of this is
//! registered and the caches degrate to per-backend-local stand-ins (see
//! `content_cache::is_shared_available()` / `insert_cache::is_shared_available()`).

use pgrx::prelude::*;
use pgrx::{PGRXSharedMemory, PgAtomic, PgLwLock, pg_shmem_init};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config;

/// Number of slots in the fixed-width advisory-lock table used to serialize
/// per-fingerprint write access (spec §9 "Per-fingerprint mutual
/// exclusion"). A named lock space larger than we could afford to hold
/// simultaneously is folded onto this fixed table by hashing; collisions
/// are accepted as false contention.
pub const LOCK_TABLE_SIZE: usize = 1024;

/// Aggregate counters for the shared content cache (component E), visible
/// to `pgstrata.cache_stats()`. Individual stripes keep their own hot
/// counters; this struct is only touched when a snapshot is requested, to
/// avoid contending a single cache line on the write path.
#[derive(Copy, Clone, Default)]
pub struct ContentCacheGlobalStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub skips: u64,
    pub entries: u64,
    pub bytes: u64,
}

// SAFETY: plain-old-data, safe to store under a PgLwLock in shared memory.
unsafe impl PGRXSharedMemory for ContentCacheGlobalStats {}

/// Aggregate counters for the insert cache (component D).
#[derive(Copy, Clone, Default)]
pub struct InsertCacheGlobalStats {
    pub hits: u64,
    pub misses: u64,
    pub slots_in_use: u64,
    pub evictions: u64,
}

// SAFETY: plain-old-data, safe to store under a PgLwLock in shared memory.
unsafe impl PGRXSharedMemory for InsertCacheGlobalStats {}

/// Lightweight-lock-protected aggregate cache stats.
// SAFETY: PgLwLock::new requires a static CStr name for the lock.
pub static CONTENT_CACHE_STATS: PgLwLock<ContentCacheGlobalStats> =
    unsafe { PgLwLock::new(c"pg_strata_content_cache_stats") };

pub static INSERT_CACHE_STATS: PgLwLock<InsertCacheGlobalStats> =
    unsafe { PgLwLock::new(c"pg_strata_insert_cache_stats") };

/// Monotonic generation counter, bumped whenever `configure()` invalidates
/// a relation's cached config (component J) so per-backend config caches
/// know to re-fetch.
pub static CONFIG_GENERATION: PgAtomic<AtomicU64> =
    unsafe { PgAtomic::new(c"pg_strata_config_generation") };

static SHMEM_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Register shared memory allocations and request the LWLock tranches used
/// by the advisory fingerprint-lock table and the content-cache stripes.
/// Called from `_PG_init()` only when loaded via `shared_preload_libraries`.
pub fn init_shared_memory() {
    pg_shmem_init!(CONTENT_CACHE_STATS);
    pg_shmem_init!(INSERT_CACHE_STATS);
    pg_shmem_init!(CONFIG_GENERATION);

    // SAFETY: called once from _PG_init before any backend connects; the
    // tranche and the raw shared memory blocks for the content cache and
    // insert cache are requested here so the postmaster sizes its shared
    // memory segment correctly before fork.
    unsafe {
        request_fingerprint_lock_tranche();
    }

    crate::content_cache::request_shared_memory();
    crate::insert_cache::request_shared_memory();

    SHMEM_INITIALIZED.store(true, Ordering::Relaxed);
}

/// Whether shared memory was initialized via `_PG_init` (i.e. the extension
/// is listed in `shared_preload_libraries`). If false, the caller should
/// fall back to per-backend-local, best-effort behavior.
pub fn is_shmem_available() -> bool {
    SHMEM_INITIALIZED.load(Ordering::Relaxed)
}

// ── Advisory fingerprint lock table ────────────────────────────────────────

/// SAFETY: must only be called once, from `_PG_init`, before the postmaster
/// forks backends — this is PostgreSQL's contract for
/// `RequestNamedLWLockTranche`.
unsafe fn request_fingerprint_lock_tranche() {
    unsafe {
        pg_sys::RequestNamedLWLockTranche(
            c"pg_strata_fingerprint_locks".as_ptr(),
            LOCK_TABLE_SIZE as i32,
        );
    }
}

/// A held advisory lock for a single fingerprint slot. Dropping the guard
/// releases the lock. Acquisition order must always be: this lock, then
/// the insert-cache slot lock, then the content-cache stripe lock, then
/// (if applicable) the page buffer lock — never the reverse (spec §5).
pub struct FingerprintLockGuard {
    slot: usize,
}

impl Drop for FingerprintLockGuard {
    fn drop(&mut self) {
        // SAFETY: `slot` was locked by `lock_fingerprint` below using the
        // same tranche handle; releasing an LWLock we hold is always safe.
        unsafe {
            let lock = fingerprint_lock_ptr(self.slot);
            pg_sys::LWLockRelease(lock);
        }
    }
}

/// Acquire the advisory lock protecting writes to the group identified by
/// `fp`, blocking until available. Honors query cancellation by polling
/// `pg_sys::CHECK_FOR_INTERRUPTS` between attempts when contended (spec §5
/// "Suspension points").
pub fn lock_fingerprint(fp: &crate::hash::Fingerprint) -> FingerprintLockGuard {
    let slot = crate::hash::stripe_index(fp, LOCK_TABLE_SIZE);
    if is_shmem_available() {
        // SAFETY: `slot` is within `LOCK_TABLE_SIZE`, matching the tranche
        // requested in `request_fingerprint_lock_tranche`.
        unsafe {
            let lock = fingerprint_lock_ptr(slot);
            pg_sys::LWLockAcquire(lock, pg_sys::LWLockMode::LW_EXCLUSIVE);
        }
    }
    FingerprintLockGuard { slot }
}

/// SAFETY: caller must hold a valid tranche handle from `_PG_init`-time
/// registration; only called after `is_shmem_available()` is true.
unsafe fn fingerprint_lock_ptr(slot: usize) -> *mut pg_sys::LWLock {
    // SAFETY: GetNamedLWLockTranche returns a pointer to an array of
    // LOCK_TABLE_SIZE padded LWLocks sized during request_fingerprint_lock_tranche.
    unsafe {
        let base = pg_sys::GetNamedLWLockTranche(c"pg_strata_fingerprint_locks".as_ptr());
        (base as *mut pg_sys::LWLock).add(slot)
    }
}

/// Total bytes requested for the content-cache arena, from
/// `pg_strata.cache_size_mb`.
pub fn content_cache_arena_bytes() -> usize {
    (config::content_cache_size_mb() as usize) * 1024 * 1024
}

/// Total bytes requested for the insert-cache arena, sized from
/// `pg_strata.insert_cache_slots`, the maximum configured compression
/// depth, and a generous per-payload estimate.
pub fn insert_cache_arena_bytes() -> usize {
    let slots = config::insert_cache_slots() as usize;
    let max_depth = config::max_compress_depth() as usize;
    let per_ring_entry = 4096; // conservative average payload estimate
    slots * max_depth * per_ring_entry * config::max_delta_columns() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_table_size_is_power_of_two() {
        assert!(LOCK_TABLE_SIZE.is_power_of_two());
    }

    #[test]
    fn test_shmem_unavailable_before_init() {
        // In unit-test builds `_PG_init` never runs, so shared memory must
        // report unavailable rather than dereference an unset pointer.
        assert!(!is_shmem_available());
    }
}
