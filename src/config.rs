//! GUC (Grand Unified Configuration) variables for pg_strata.
//!
//! These are registered in `_PG_init()` and control the extension's
//! process-wide, non-per-relation behavior (spec §6 "Tunables"). Per-relation
//! settings (group/order/delta columns, K, D, ...) live in the persisted
//! registry (component J, `src/catalog.rs`), not here.
//!
//! All GUC names are prefixed with `pg_strata.`.

use pgrx::guc::*;

/// Master enable/disable switch. When false, the table access method
/// degrades to a pass-through (every column stored as a keyframe, no
/// caching) rather than refusing DML outright.
pub static PGS_ENABLED: GucSetting<bool> = GucSetting::<bool>::new(true);

/// Total size of the shared LRU content cache (component E), in megabytes.
pub static PGS_CACHE_SIZE_MB: GucSetting<i32> = GucSetting::<i32>::new(256);

/// Maximum number of entries the content cache will track, regardless of
/// `cache_size_mb` (a second, independent bound).
pub static PGS_CACHE_MAX_ENTRIES: GucSetting<i32> = GucSetting::<i32>::new(1_000_000);

/// Fixed slot size (KB) for the content cache's shared-memory arena. A
/// payload larger than one slot spans multiple contiguous slots.
pub static PGS_CACHE_SLOT_SIZE_KB: GucSetting<i32> = GucSetting::<i32>::new(8);

/// Number of independently-locked stripes (partitions) in the content
/// cache (component E). Higher values reduce stripe-lock contention.
pub static PGS_CACHE_PARTITIONS: GucSetting<i32> = GucSetting::<i32>::new(32);

/// Entries larger than this (KB) are rejected by the content cache and
/// counted as a `skip` rather than evicting other entries to make room.
pub static PGS_CACHE_MAX_ENTRY_KB: GucSetting<i32> = GucSetting::<i32>::new(512);

/// Per-backend memory budget (MB) for the `group → max_seq` sequence cache
/// (component C).
pub static PGS_SEQ_CACHE_SIZE_MB: GucSetting<i32> = GucSetting::<i32>::new(16);

/// Per-backend memory budget (MB) for the `seq → locator` cache
/// (component C).
pub static PGS_TID_CACHE_SIZE_MB: GucSetting<i32> = GucSetting::<i32>::new(16);

/// Number of slots in the shared insert cache (component D).
pub static PGS_INSERT_CACHE_SLOTS: GucSetting<i32> = GucSetting::<i32>::new(16);

/// Hard cap on the number of delta columns a single relation may configure.
pub static PGS_MAX_DELTA_COLUMNS: GucSetting<i32> = GucSetting::<i32>::new(16);

/// Hard cap on `compress_depth` (D) any relation may configure; used to
/// size the insert-cache arena up front since ring capacity is fixed per
/// process start.
pub static PGS_MAX_COMPRESS_DEPTH: GucSetting<i32> = GucSetting::<i32>::new(8);

/// Number of persistent encode worker threads (component F). `0` disables
/// the pool and runs encoding inline on the calling backend's thread.
pub static PGS_ENCODE_THREADS: GucSetting<i32> = GucSetting::<i32>::new(0);

/// Register all GUC variables. Called unconditionally from `_PG_init()`,
/// even when not loaded via `shared_preload_libraries` (GUCs themselves
/// don't require shared memory).
pub fn register_gucs() {
    GucRegistry::define_bool_guc(
        c"pg_strata.enabled",
        c"Master enable/disable switch for pg_strata.",
        c"When false, relations configured for delta storage store every column as a keyframe and caching is bypassed.",
        &PGS_ENABLED,
        GucContext::Suset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.cache_size_mb",
        c"Total size of the shared LRU content cache, in megabytes.",
        c"Larger values reduce the number of reconstruction walks needed to answer a SELECT on a delta row.",
        &PGS_CACHE_SIZE_MB,
        1,      // min
        65_536, // max (64 GB)
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.cache_max_entries",
        c"Maximum number of entries tracked by the content cache.",
        c"An independent bound alongside cache_size_mb; whichever limit is reached first governs eviction.",
        &PGS_CACHE_MAX_ENTRIES,
        1,
        100_000_000,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.cache_slot_size_kb",
        c"Fixed slot size (KB) for the content cache arena.",
        c"Payloads larger than one slot consume multiple contiguous slots.",
        &PGS_CACHE_SLOT_SIZE_KB,
        1,
        1024,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.cache_partitions",
        c"Number of independently-locked stripes in the content cache.",
        c"Higher values reduce stripe-lock contention under concurrent reads across many groups. Must be a power of two.",
        &PGS_CACHE_PARTITIONS,
        1,
        4096,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.cache_max_entry_kb",
        c"Entries larger than this size (KB) are rejected by the content cache.",
        c"Rejections are counted as a 'skip' in cache_stats() rather than evicting other entries to make room for an oversized one.",
        &PGS_CACHE_MAX_ENTRY_KB,
        1,
        1_048_576,
        GucContext::Suset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.seq_cache_size_mb",
        c"Per-backend memory budget for the group -> max_seq cache.",
        c"On eviction the value is simply recomputed by scanning; this bound only affects hit rate, never correctness.",
        &PGS_SEQ_CACHE_SIZE_MB,
        1,
        4096,
        GucContext::Suset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.tid_cache_size_mb",
        c"Per-backend memory budget for the seq -> row locator cache.",
        c"On eviction the reconstruction walker falls back to an index probe; this bound only affects speed, never correctness.",
        &PGS_TID_CACHE_SIZE_MB,
        1,
        4096,
        GucContext::Suset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.insert_cache_slots",
        c"Number of slots in the shared insert cache.",
        c"Each slot holds one (relation, group) FIFO of recently-inserted raw payloads, sized to that relation's compress_depth.",
        &PGS_INSERT_CACHE_SLOTS,
        1,
        65_536,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.max_delta_columns",
        c"Maximum number of delta columns any single relation may configure.",
        c"Bounds per-row encode-pool batch size and insert-cache ring memory.",
        &PGS_MAX_DELTA_COLUMNS,
        1,
        256,
        GucContext::Suset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.max_compress_depth",
        c"Maximum compress_depth (D) any relation may configure.",
        c"Used to size the insert-cache arena up front, since ring capacity is fixed for the process lifetime.",
        &PGS_MAX_COMPRESS_DEPTH,
        1,
        1024,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_strata.encode_threads",
        c"Number of persistent encode worker threads (0 = inline).",
        c"When 0, every delta column of an inserted row is encoded inline on the calling backend's thread instead of being dispatched to the pool.",
        &PGS_ENCODE_THREADS,
        0,
        256,
        GucContext::Suset,
        GucFlags::default(),
    );
}

pub fn enabled() -> bool {
    PGS_ENABLED.get()
}

pub fn content_cache_size_mb() -> i32 {
    PGS_CACHE_SIZE_MB.get()
}

pub fn cache_max_entries() -> i32 {
    PGS_CACHE_MAX_ENTRIES.get()
}

pub fn cache_slot_size_kb() -> i32 {
    PGS_CACHE_SLOT_SIZE_KB.get()
}

pub fn cache_partitions() -> i32 {
    PGS_CACHE_PARTITIONS.get()
}

pub fn cache_max_entry_kb() -> i32 {
    PGS_CACHE_MAX_ENTRY_KB.get()
}

pub fn seq_cache_size_mb() -> i32 {
    PGS_SEQ_CACHE_SIZE_MB.get()
}

pub fn tid_cache_size_mb() -> i32 {
    PGS_TID_CACHE_SIZE_MB.get()
}

pub fn insert_cache_slots() -> i32 {
    PGS_INSERT_CACHE_SLOTS.get()
}

pub fn max_delta_columns() -> i32 {
    PGS_MAX_DELTA_COLUMNS.get()
}

pub fn max_compress_depth() -> i32 {
    PGS_MAX_COMPRESS_DEPTH.get()
}

pub fn encode_threads() -> i32 {
    PGS_ENCODE_THREADS.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        assert!(PGS_CACHE_SIZE_MB.get() > 0);
        assert!(PGS_CACHE_PARTITIONS.get().is_power_of_two());
        assert!(PGS_MAX_COMPRESS_DEPTH.get() >= 1);
        assert_eq!(PGS_ENCODE_THREADS.get(), 0);
    }
}
