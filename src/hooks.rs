//! Relation-lifecycle hooks: cleanup on `DROP TABLE` and the pre-commit
//! flush of component H's per-backend stats accumulator.
//!
//! ## Event trigger: `pg_strata_drop_tracker`
//!
//! Installed via `extension_sql!()` in `lib.rs` as `ON sql_drop`. When a
//! table configured through `pgstrata.configure()` is dropped, the handler
//! queries `pg_event_trigger_dropped_objects()` and clears every piece of
//! state this engine keeps for that relation: the `strata_relations` row,
//! the `group_stats` rows, the per-backend config cache, and the content
//! and insert cache tiers (components E and D never outlive a dropped
//! relation's heap either, but nothing proactively purges them keyed by
//! relation — the explicit invalidation here is what actually keys them
//! out). Mirrors the teacher's own drop-event trigger in shape, down to
//! being the only DDL hook this engine needs — there is no upstream
//! dependency graph to cascade through, only a relation's own storage.
//!
//! ## Pre-commit callback: stats flush
//!
//! `src/tableam.rs` accumulates per-group row/size counters in a
//! thread-local [`crate::stats::StatsAccumulator`] as rows are
//! inserted/deleted (spec.md §5: "backend-private until flushed"). A
//! `RegisterXactCallback` hook fires at `XACT_EVENT_PRE_COMMIT`, drains
//! that accumulator, and issues one batched upsert per touched relation
//! through [`catalog::flush_stats`] — so a transaction that inserts a
//! million rows into one group still does one `group_stats` write, not a
//! million. On abort, the accumulator is simply discarded.

use std::collections::HashMap;
use std::os::raw::c_void;

use pgrx::prelude::*;

use crate::catalog::{self, RelationConfig};
use crate::error::StrataError;
use crate::hash::Fingerprint;
use crate::stats::DeltaStats;
use crate::{storage, tableam};

// ── Event trigger handler ───────────────────────────────────────────────

/// Handler for the `sql_drop` event trigger.
///
/// Registered via `extension_sql!()` in `lib.rs` as:
/// ```sql
/// CREATE FUNCTION pgstrata._on_sql_drop() RETURNS event_trigger ...
/// CREATE EVENT TRIGGER pg_strata_drop_tracker ON sql_drop
///     EXECUTE FUNCTION pgstrata._on_sql_drop();
/// ```
#[pg_extern(schema = "pgstrata", name = "_on_sql_drop", sql = false)]
fn pg_strata_on_sql_drop() {
    let dropped = match collect_dropped_tables() {
        Ok(objs) => objs,
        Err(e) => {
            // pg_event_trigger_dropped_objects() is only valid inside an
            // event trigger context; this also fires harmlessly during
            // CREATE EXTENSION itself.
            pgrx::debug1!(
                "pg_strata_drop_tracker: could not read dropped objects: {}",
                e
            );
            return;
        }
    };

    for relid in dropped {
        handle_dropped_relation(relid);
    }
}

/// Collect the OIDs of dropped `table` objects from the event trigger
/// context. Drops of anything else (indexes, views, ...) are irrelevant —
/// `pgstrata.configure()` only ever targets base tables.
fn collect_dropped_tables() -> Result<Vec<pg_sys::Oid>, StrataError> {
    Spi::connect(|client| {
        let table = client
            .select(
                "SELECT objid, object_type FROM pg_event_trigger_dropped_objects()",
                None,
                &[],
            )
            .map_err(spi_err)?;

        let mut relids = Vec::new();
        for row in table {
            let object_type = row.get::<String>(2).map_err(spi_err)?.unwrap_or_default();
            if object_type != "table" {
                continue;
            }
            let objid = row
                .get::<pg_sys::Oid>(1)
                .map_err(spi_err)?
                .unwrap_or(pg_sys::InvalidOid);
            relids.push(objid);
        }
        Ok(relids)
    })
}

/// Tear down every piece of state this engine keeps for a dropped
/// relation. A no-op for relations `pgstrata.configure()` never touched.
fn handle_dropped_relation(relid: pg_sys::Oid) {
    match RelationConfig::load(relid) {
        Ok(Some(_)) => {}
        Ok(None) => return,
        Err(e) => {
            pgrx::warning!(
                "pg_strata_drop_tracker: failed to look up configuration for dropped relation {}: {}",
                relid.to_u32(),
                e,
            );
            return;
        }
    }

    if let Err(e) = RelationConfig::drop_for_relation(relid) {
        pgrx::warning!(
            "pg_strata_drop_tracker: failed to remove configuration for dropped relation {}: {}",
            relid.to_u32(),
            e,
        );
    }

    if let Err(e) = catalog::drop_stats_for_relation(relid) {
        pgrx::warning!(
            "pg_strata_drop_tracker: failed to remove group_stats for dropped relation {}: {}",
            relid.to_u32(),
            e,
        );
    }

    catalog::ConfigRegistry::invalidate(relid);
    storage::invalidate_relation(relid.to_u32());
    tableam::with_stats(|acc| acc.discard_relation(relid.to_u32()));

    log!(
        "pg_strata_drop_tracker: cleared delta-storage state for dropped relation {}",
        relid.to_u32(),
    );
}

fn spi_err(e: pgrx::spi::SpiError) -> StrataError {
    StrataError::SpiError(e.to_string())
}

// ── Pre-commit stats flush ──────────────────────────────────────────────

/// Registers [`flush_stats_on_xact_event`] as this backend's
/// `RegisterXactCallback` hook. Called once from `_PG_init()`; PostgreSQL
/// re-invokes `_PG_init()` in every backend that loads the library, so one
/// registration per backend is exactly right — there is no unregister
/// path because the callback needs to live for the backend's lifetime.
pub fn register_stats_flush() {
    // SAFETY: RegisterXactCallback is safe to call during _PG_init with a
    // function pointer of the correct `XactCallback` signature and a null
    // (unused) argument.
    unsafe {
        pg_sys::RegisterXactCallback(Some(flush_stats_on_xact_event), std::ptr::null_mut());
    }
}

#[pg_guard]
unsafe extern "C-unwind" fn flush_stats_on_xact_event(event: pg_sys::XactEvent, _arg: *mut c_void) {
    match event {
        pg_sys::XactEvent_XACT_EVENT_PRE_COMMIT | pg_sys::XactEvent_XACT_EVENT_PARALLEL_PRE_COMMIT => {
            flush_pending_stats();
        }
        pg_sys::XactEvent_XACT_EVENT_ABORT | pg_sys::XactEvent_XACT_EVENT_PARALLEL_ABORT => {
            // Roll back: whatever this transaction accumulated never
            // happened, so it is dropped rather than flushed.
            let _ = tableam::take_stats();
        }
        _ => {}
    }
}

fn flush_pending_stats() {
    let mut acc = tableam::take_stats();
    if acc.is_empty() {
        return;
    }

    for (relid_u32, deltas) in group_deltas_by_relation(acc.drain()) {
        let relid = pg_sys::Oid::from(relid_u32);
        if let Err(e) = catalog::flush_stats(relid, deltas) {
            pgrx::warning!(
                "pg_strata: failed to flush group_stats for relation {}: {}",
                relid_u32,
                e,
            );
        }
    }
}

/// Split one transaction's drained deltas into one batch per relation, so
/// [`catalog::flush_stats`] — which issues one upsert per call — is invoked
/// once per touched relation rather than once per touched group.
fn group_deltas_by_relation(
    entries: Vec<((u32, Fingerprint), DeltaStats)>,
) -> HashMap<u32, Vec<((u32, Fingerprint), DeltaStats)>> {
    let mut by_relation: HashMap<u32, Vec<((u32, Fingerprint), DeltaStats)>> = HashMap::new();
    for entry in entries {
        by_relation.entry(entry.0.0).or_default().push(entry);
    }
    by_relation
}
