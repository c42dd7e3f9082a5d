//! Storage layer (component G) — converts between logical and physical
//! rows, runs the write-path encode pipeline, and implements the
//! reconstruction planner that walks a delta chain back to a keyframe.
//!
//! This module is deliberately decoupled from heap/page access: it talks to
//! the host only through the [`PhysicalAccess`] trait, which `src/tableam.rs`
//! implements against real `pg_sys` tuple slots. That split keeps the
//! sequencing/caching/encoding algorithm (spec §4.G) unit-testable without a
//! running PostgreSQL instance, the same way the teacher keeps DVM operator
//! logic (`src/dvm/operators/`) free of SPI calls and tests it with
//! `test_helpers.rs` fixtures instead.

use crate::codec::{self, CandidateBase};
use crate::error::StrataError;
use crate::hash::Fingerprint;
use crate::insert_cache;
use crate::seq_cache::{self, RowLocator};
use crate::shmem;
use crate::stats::StatsAccumulator;

/// One delta column's stored form, independent of the user-column payload
/// around it (spec §3 "Stored row" / §6 "Physical row layout").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredColumn {
    Keyframe(Vec<u8>),
    Delta { tag: u16, bytes: Vec<u8> },
}

impl StoredColumn {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, StoredColumn::Keyframe(_))
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            StoredColumn::Keyframe(b) => b.len(),
            StoredColumn::Delta { bytes, .. } => bytes.len(),
        }
    }
}

/// A physical row as seen by the storage layer: its engine-managed `seq`
/// and the stored form of every configured delta column, in configuration
/// order. The host's own (non-delta) columns are opaque to this module —
/// `tableam.rs` carries them through untouched.
#[derive(Debug, Clone)]
pub struct PhysicalRow {
    pub seq: u64,
    pub columns: Vec<StoredColumn>,
}

/// The host-side hooks the storage layer needs: fetching a row by physical
/// locator or by `seq` (for the reconstruction walker and base lookups),
/// and writing a freshly encoded row. Implemented against real heap tuples
/// in `src/tableam.rs`; implemented by an in-memory `Vec` in this module's
/// unit tests.
pub trait PhysicalAccess {
    /// Fetch the row at a given `seq` within the group being operated on.
    /// Returns `Ok(None)` if no such row is visible to the caller's
    /// snapshot (spec §7 "Consistency" — the caller turns this into
    /// `BaseRowMissing` when it was expected to exist).
    fn fetch_by_seq(&self, seq: u64) -> Result<Option<(PhysicalRow, RowLocator)>, StrataError>;

    /// Fetch by a previously cached locator; a locator miss/staleness
    /// (e.g. pruned by concurrent VACUUM) must be reported as `Ok(None)`,
    /// never as an error — the caller always has the seq-based fallback.
    fn fetch_by_locator(&self, locator: RowLocator) -> Result<Option<PhysicalRow>, StrataError>;

    /// Persist a fully encoded physical row, returning its locator.
    fn write(&mut self, row: &PhysicalRow) -> Result<RowLocator, StrataError>;

    /// Authoritative fallback for the group's `max_seq` on a cache miss
    /// (spec §4.C: "On miss, scanned from the relation"): a visibility-aware
    /// scan for the highest `seq` belonging to this group, or `0` if the
    /// group has no visible rows yet. Must reflect only committed, visible
    /// rows — a backend that crashed mid-INSERT must never contribute its
    /// uncommitted `seq` here (spec §8 scenario 6).
    fn scan_authoritative_max(&self) -> Result<u64, StrataError>;
}

/// Everything the encode pipeline needs to know about a relation, trimmed
/// to what component G actually consumes (full config lives in
/// `catalog::RelationConfig`).
pub struct EncodeParams {
    pub relation: u32,
    pub fingerprint: Fingerprint,
    pub keyframe_interval: i32,
    pub compress_depth: i32,
    pub use_secondary_compression: bool,
    pub num_delta_columns: usize,
}

/// Whether the position `seq` (1-based) is a mandatory keyframe position
/// per the relation's keyframe interval `K` (spec §3 invariant: "A row with
/// `seq = n*K + 1` ... is a keyframe ... for every delta column").
pub fn is_keyframe_position(seq: u64, keyframe_interval: i32) -> bool {
    let k = keyframe_interval.max(1) as u64;
    (seq - 1) % k == 0
}

/// Outcome of a successful insert: the allocated `seq` and the stored form
/// chosen for each delta column, for the caller to assemble into the full
/// physical tuple (user columns + seq + delta columns) and hand to the host
/// heap.
pub struct InsertOutcome {
    pub seq: u64,
    pub columns: Vec<StoredColumn>,
}

/// Run the full write-path pipeline for one row's delta columns (spec
/// §4.G "On write"), given the raw target bytes for each configured delta
/// column in order. The caller must already hold the fingerprint's advisory
/// lock (`shmem::lock_fingerprint`) for the duration of this call and the
/// subsequent heap write — lock scope spans both so no other backend can
/// interleave a `seq` allocation or insert-cache push for the same group.
///
/// On success, the caller is responsible for:
/// 1. Writing the physical tuple (user columns + `seq` + `columns`) to the
///    host heap, obtaining a `RowLocator`.
/// 2. Calling [`commit_insert`] with that locator to reveal the insert-cache
///    entry and update the sequence/locator caches.
///
/// On any internal failure, the allocated `seq` is released back
/// immediately (spec §7: "Partial failures within a multi-column INSERT
/// roll back the entire row").
pub fn encode_insert(
    params: &EncodeParams,
    access: &dyn PhysicalAccess,
    target_values: &[Vec<u8>],
) -> Result<InsertOutcome, StrataError> {
    debug_assert_eq!(target_values.len(), params.num_delta_columns);

    let cached_max = seq_cache::cached_max_seq(params.relation, &params.fingerprint);
    let authoritative_max = match cached_max {
        Some(m) => m,
        None => access.scan_authoritative_max()?,
    };
    let (seq, pre_max) =
        seq_cache::allocate_seq(params.relation, &params.fingerprint, authoritative_max)?;

    let result = encode_insert_at_seq(params, access, target_values, seq);
    if result.is_err() {
        seq_cache::release_seq(params.relation, &params.fingerprint, seq, pre_max);
    }
    result
}

fn encode_insert_at_seq(
    params: &EncodeParams,
    access: &dyn PhysicalAccess,
    target_values: &[Vec<u8>],
    seq: u64,
) -> Result<InsertOutcome, StrataError> {
    let depth = params.compress_depth.max(1) as usize;
    let (slot, is_new) = insert_cache::get_slot(
        params.relation,
        &params.fingerprint,
        depth,
        params.num_delta_columns,
    );

    if is_new && seq > 1 {
        populate_insert_cache_slot(params, access, slot, seq, depth)?;
    }

    let force_keyframe = is_keyframe_position(seq, params.keyframe_interval);

    let mut columns = Vec::with_capacity(params.num_delta_columns);
    for (col_idx, target) in target_values.iter().enumerate() {
        let encoded = if force_keyframe {
            StoredColumn::Keyframe(target.clone())
        } else {
            let bases = insert_cache::get_bases(slot, seq, col_idx)
                .into_iter()
                .map(|(_, tag, bytes)| CandidateBase { tag, bytes })
                .collect::<Vec<_>>();
            let result = codec::encode(&bases, target, params.use_secondary_compression);
            if result.is_keyframe() {
                StoredColumn::Keyframe(target.clone())
            } else {
                StoredColumn::Delta {
                    tag: result.tag,
                    bytes: result.bytes,
                }
            }
        };
        columns.push(encoded);
    }

    // Push every column's raw target into the insert cache before
    // commit_entry reveals the seq atomically across all of them (spec
    // §4.D: "Must happen only after every column's push for seq has
    // succeeded").
    for (col_idx, target) in target_values.iter().enumerate() {
        insert_cache::push(slot, seq, col_idx, target.clone());
    }

    Ok(InsertOutcome { seq, columns })
}

/// Cold-fill a newly created insert-cache slot by reconstructing the last
/// `depth` rows of each delta column (spec §4.D `populate`).
fn populate_insert_cache_slot(
    params: &EncodeParams,
    access: &dyn PhysicalAccess,
    slot: insert_cache::SlotHandle,
    new_seq: u64,
    depth: usize,
) -> Result<(), StrataError> {
    let start = new_seq.saturating_sub(depth as u64).max(1);
    for seq in start..new_seq {
        let Some((row, _locator)) = access.fetch_by_seq(seq)? else {
            continue;
        };
        for (col_idx, _) in row.columns.iter().enumerate() {
            let bytes = reconstruct_column(params.relation, &params.fingerprint, access, seq, col_idx)?;
            insert_cache::push(slot, seq, col_idx, bytes);
        }
        insert_cache::commit_entry(slot, seq);
    }
    Ok(())
}

/// Finalize a successful insert after the host heap write: reveal the
/// insert-cache entry, advance the locator cache, and record stats.
pub fn commit_insert(
    params: &EncodeParams,
    stats: &mut StatsAccumulator,
    outcome: &InsertOutcome,
    locator: RowLocator,
) {
    let depth = params.compress_depth.max(1) as usize;
    let (slot, _) = insert_cache::get_slot(
        params.relation,
        &params.fingerprint,
        depth,
        params.num_delta_columns,
    );
    insert_cache::commit_entry(slot, outcome.seq);
    seq_cache::set_locator(params.relation, outcome.seq, locator);

    for col in &outcome.columns {
        let tag = match col {
            StoredColumn::Keyframe(_) => 0,
            StoredColumn::Delta { tag, .. } => *tag,
        };
        stats.record_insert(
            params.relation,
            params.fingerprint,
            outcome.seq,
            col.is_keyframe(),
            col.encoded_len(),
            col.encoded_len(),
            tag,
        );
    }
}

/// Undo a partially-completed insert: release the seq and drop any
/// insert-cache entries that were pushed but never committed (they are
/// simply invisible until overwritten, so nothing further is required
/// there; this function exists for symmetry/documentation and to make the
/// rollback path explicit at call sites per spec §7).
pub fn rollback_insert(params: &EncodeParams, allocated_seq: u64, pre_allocation_max: u64) {
    seq_cache::release_seq(params.relation, &params.fingerprint, allocated_seq, pre_allocation_max);
}

// ── Reconstruction planner (spec §4.G "On read") ───────────────────────

/// Reconstruct a single delta column's value for `seq`, walking the base
/// chain back to a keyframe as needed, probing the shared content cache at
/// every step, and populating it on the way back out (spec §4.G steps 1-2,
/// Testable property 3's round-trip guarantee).
pub fn reconstruct_column(
    relation: u32,
    fingerprint: &Fingerprint,
    access: &dyn PhysicalAccess,
    seq: u64,
    col_idx: usize,
) -> Result<Vec<u8>, StrataError> {
    let key = crate::content_cache::CacheKey {
        fingerprint: *fingerprint,
        seq,
        col_idx: col_idx as u16,
    };
    if let Some(bytes) = crate::content_cache::probe(&key) {
        return Ok(bytes);
    }

    let (row, _locator) = fetch_row_checked(relation, access, seq)?;
    let column = row
        .columns
        .get(col_idx)
        .ok_or_else(|| StrataError::InternalError(format!("column index {col_idx} out of range")))?;

    let bytes = match column {
        StoredColumn::Keyframe(bytes) => bytes.clone(),
        StoredColumn::Delta { tag, bytes } => {
            if *tag == 0 || *tag as u64 >= seq {
                return Err(StrataError::ReconstructionFailed(seq, col_idx.to_string()));
            }
            let base_seq = seq - *tag as u64;
            let base_bytes = reconstruct_column(relation, fingerprint, access, base_seq, col_idx)?;
            codec::decode(&base_bytes, bytes)?
        }
    };

    crate::content_cache::insert(key, bytes.clone());
    Ok(bytes)
}

fn fetch_row_checked(
    relation: u32,
    access: &dyn PhysicalAccess,
    seq: u64,
) -> Result<(PhysicalRow, RowLocator), StrataError> {
    if let Some(locator) = seq_cache::get_locator(relation, seq)
        && let Some(row) = access.fetch_by_locator(locator)?
    {
        return Ok((row, locator));
    }
    access
        .fetch_by_seq(seq)?
        .ok_or_else(|| StrataError::BaseRowMissing(seq + 1, seq, relation))
}

// ── DELETE cascade (spec §4.G "On DELETE") ──────────────────────────────

/// Invalidate every cache tier for rows with `seq >= from_seq` in group
/// `fingerprint`, after the host has cascaded the actual row deletes within
/// the same transaction (spec §4.G, §8 invariant 6).
pub fn invalidate_for_delete(relation: u32, fingerprint: &Fingerprint, from_seq: u64) {
    insert_cache::invalidate_from_seq(relation, fingerprint, from_seq);
    crate::content_cache::invalidate(fingerprint, from_seq);
    seq_cache::invalidate_locators_from(relation, from_seq);
    if from_seq <= 1 {
        seq_cache::invalidate_group(relation, fingerprint);
    } else {
        // The group still exists with a lower max_seq; the cache is simply
        // stale now, not wrong to keep querying — invalidate so the next
        // allocate() re-derives it from an authoritative scan.
        seq_cache::invalidate_group(relation, fingerprint);
    }
}

/// Clear every cache tier belonging to `relation` (TRUNCATE, spec §4.I).
pub fn invalidate_relation(relation: u32) {
    insert_cache::invalidate_rel(relation);
    seq_cache::invalidate_relation(relation);
    // Component E has no relation-scoped invalidation API (its key space is
    // purely fingerprint+seq+col) — a TRUNCATE's fingerprints are unknown in
    // general, so stale content-cache entries for a truncated relation are
    // left to be naturally evicted by LRU pressure, same as the teacher's
    // content cache does not track relation identity in its key either.
    let _ = shmem::is_shmem_available();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeAccess {
        rows: RefCell<HashMap<u64, PhysicalRow>>,
        next_locator: RefCell<u32>,
    }

    impl FakeAccess {
        fn new() -> Self {
            Self {
                rows: RefCell::new(HashMap::new()),
                next_locator: RefCell::new(0),
            }
        }
    }

    impl PhysicalAccess for FakeAccess {
        fn fetch_by_seq(&self, seq: u64) -> Result<Option<(PhysicalRow, RowLocator)>, StrataError> {
            Ok(self.rows.borrow().get(&seq).cloned().map(|r| {
                (
                    r,
                    RowLocator {
                        block: 0,
                        offset: seq as u16,
                    },
                )
            }))
        }

        fn fetch_by_locator(&self, locator: RowLocator) -> Result<Option<PhysicalRow>, StrataError> {
            Ok(self.rows.borrow().get(&(locator.offset as u64)).cloned())
        }

        fn write(&mut self, row: &PhysicalRow) -> Result<RowLocator, StrataError> {
            let mut n = self.next_locator.borrow_mut();
            *n += 1;
            self.rows.borrow_mut().insert(row.seq, row.clone());
            Ok(RowLocator {
                block: 0,
                offset: row.seq as u16,
            })
        }

        fn scan_authoritative_max(&self) -> Result<u64, StrataError> {
            Ok(self.rows.borrow().keys().copied().max().unwrap_or(0))
        }
    }

    fn fp(b: u8) -> Fingerprint {
        let mut f = [0u8; 16];
        f[0] = b;
        f
    }

    fn params(relation: u32, f: Fingerprint, k: i32, d: i32) -> EncodeParams {
        EncodeParams {
            relation,
            fingerprint: f,
            keyframe_interval: k,
            compress_depth: d,
            use_secondary_compression: false,
            num_delta_columns: 1,
        }
    }

    #[test]
    fn test_first_insert_is_always_a_keyframe() {
        let access = FakeAccess::new();
        let p = params(9001, fp(1), 100, 2);
        let outcome = encode_insert(&p, &access, &[b"hello".to_vec()]).unwrap();
        assert_eq!(outcome.seq, 1);
        assert!(outcome.columns[0].is_keyframe());
    }

    #[test]
    fn test_keyframe_interval_forces_keyframes() {
        let mut access = FakeAccess::new();
        let p = params(9002, fp(1), 3, 1);
        let mut seqs_are_keyframe = Vec::new();
        for i in 0..7u64 {
            let outcome = encode_insert(&p, &access, &[vec![b'a' + i as u8; 20]]).unwrap();
            access
                .write(&PhysicalRow {
                    seq: outcome.seq,
                    columns: outcome.columns.clone(),
                })
                .unwrap();
            commit_insert(
                &p,
                &mut StatsAccumulator::new(),
                &outcome,
                RowLocator { block: 0, offset: outcome.seq as u16 },
            );
            seqs_are_keyframe.push(outcome.columns[0].is_keyframe());
        }
        // K=3: seq 1, 4, 7 (indices 0, 3, 6) must be keyframes.
        assert!(seqs_are_keyframe[0]);
        assert!(seqs_are_keyframe[3]);
        assert!(seqs_are_keyframe[6]);
    }

    #[test]
    fn test_reconstruction_walks_chain_to_keyframe() {
        let mut access = FakeAccess::new();
        let p = params(9003, fp(7), 100, 2);
        let mut stats = StatsAccumulator::new();
        let values = ["a", "ab", "abc", "abcd"];
        for v in values {
            let outcome = encode_insert(&p, &access, &[v.as_bytes().to_vec()]).unwrap();
            let row = PhysicalRow {
                seq: outcome.seq,
                columns: outcome.columns.clone(),
            };
            let locator = access.write(&row).unwrap();
            commit_insert(&p, &mut stats, &outcome, locator);
        }
        let reconstructed = reconstruct_column(9003, &fp(7), &access, 4, 0).unwrap();
        assert_eq!(reconstructed, b"abcd");
        let reconstructed2 = reconstruct_column(9003, &fp(7), &access, 2, 0).unwrap();
        assert_eq!(reconstructed2, b"ab");
    }

    #[test]
    fn test_is_keyframe_position() {
        assert!(is_keyframe_position(1, 3));
        assert!(!is_keyframe_position(2, 3));
        assert!(!is_keyframe_position(3, 3));
        assert!(is_keyframe_position(4, 3));
        assert!(is_keyframe_position(7, 3));
    }

    #[test]
    fn test_k_equals_one_every_row_is_keyframe() {
        assert!(is_keyframe_position(1, 1));
        assert!(is_keyframe_position(2, 1));
        assert!(is_keyframe_position(100, 1));
    }

    #[test]
    fn test_reconstruction_missing_base_is_corruption_error() {
        let access = FakeAccess::new();
        let err = reconstruct_column(9004, &fp(1), &access, 5, 0).unwrap_err();
        assert!(matches!(err, StrataError::BaseRowMissing(_, _, _)));
    }
}
