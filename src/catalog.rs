//! Catalog layer (component J persistence) — metadata tables and CRUD
//! operations for delta-compressed relation configuration and per-group
//! statistics.
//!
//! All catalog access goes through PostgreSQL's SPI interface, exactly as
//! the teacher's catalog layer does for its own metadata tables. This module
//! owns two persisted tables:
//!
//! - `pgstrata.strata_relations` — one row per configured relation
//!   (component J, spec §4.J).
//! - `pgstrata.group_stats` — one row per `(relation, fingerprint)`
//!   (component H's persistent sink, spec §4.H).
//!
//! Per-backend caching of `strata_relations` lives in [`ConfigRegistry`];
//! `group_stats` is never cached (it's written once per transaction by the
//! pre-commit hook and read rarely, via `stats()`/`refresh_stats()`).

use std::cell::RefCell;
use std::collections::HashMap;

use pgrx::prelude::*;

use crate::error::StrataError;
use crate::hash::Fingerprint;
use crate::stats::DeltaStats;

/// Per-relation delta-storage configuration (component J's data model,
/// spec §3 "Relation configuration").
#[derive(Debug, Clone)]
pub struct RelationConfig {
    pub relid: pg_sys::Oid,
    /// `None` means "entire relation is one group" (spec §3).
    pub group_column: Option<String>,
    pub order_column: String,
    pub delta_columns: Vec<String>,
    /// K: a row at `seq = n*K + 1` is always a keyframe.
    pub keyframe_interval: i32,
    /// D: max number of prior rows considered as candidate bases.
    pub compress_depth: i32,
    pub use_secondary_compression: bool,
    /// Open Question §9 resolution: permits a caller-supplied `__strata_seq`
    /// on INSERT as a restore write (see `src/api.rs::configure`).
    pub allow_seq_override: bool,
}

impl RelationConfig {
    fn from_row(row: &pgrx::spi::SpiHeapTupleData) -> Result<Self, StrataError> {
        let relid: pg_sys::Oid = row
            .get_by_name("relid")
            .map_err(spi_err)?
            .ok_or_else(|| StrataError::InternalError("strata_relations.relid NULL".into()))?;
        let group_column: Option<String> = row.get_by_name("group_column").map_err(spi_err)?;
        let order_column: String = row
            .get_by_name("order_column")
            .map_err(spi_err)?
            .ok_or_else(|| StrataError::InternalError("strata_relations.order_column NULL".into()))?;
        let delta_columns: Vec<String> = row
            .get_by_name::<Vec<String>>("delta_columns")
            .map_err(spi_err)?
            .unwrap_or_default();
        let keyframe_interval: i32 = row
            .get_by_name("keyframe_interval")
            .map_err(spi_err)?
            .unwrap_or(1);
        let compress_depth: i32 = row.get_by_name("compress_depth").map_err(spi_err)?.unwrap_or(1);
        let use_secondary_compression: bool = row
            .get_by_name("use_secondary_compression")
            .map_err(spi_err)?
            .unwrap_or(false);
        let allow_seq_override: bool = row
            .get_by_name("allow_seq_override")
            .map_err(spi_err)?
            .unwrap_or(false);

        Ok(Self {
            relid,
            group_column,
            order_column,
            delta_columns,
            keyframe_interval,
            compress_depth,
            use_secondary_compression,
            allow_seq_override,
        })
    }

    /// Persist a new or replacement configuration. `configure()` in
    /// `src/api.rs` calls this after validation; an existing row for the
    /// relation is overwritten (re-`configure()` is an update, not a
    /// duplicate-configuration error — that error is reserved for the
    /// teacher's create-vs-alter distinction elsewhere, see spec §6 error
    /// codes for `duplicate-configuration`, surfaced only when the caller
    /// explicitly asks for create-only semantics via the API layer).
    pub fn upsert(&self) -> Result<(), StrataError> {
        Spi::run_with_args(
            "INSERT INTO pgstrata.strata_relations \
             (relid, group_column, order_column, delta_columns, keyframe_interval, \
              compress_depth, use_secondary_compression, allow_seq_override) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (relid) DO UPDATE SET \
               group_column = EXCLUDED.group_column, \
               order_column = EXCLUDED.order_column, \
               delta_columns = EXCLUDED.delta_columns, \
               keyframe_interval = EXCLUDED.keyframe_interval, \
               compress_depth = EXCLUDED.compress_depth, \
               use_secondary_compression = EXCLUDED.use_secondary_compression, \
               allow_seq_override = EXCLUDED.allow_seq_override",
            &[
                self.relid.into(),
                self.group_column.clone().into(),
                self.order_column.clone().into(),
                self.delta_columns.clone().into(),
                self.keyframe_interval.into(),
                self.compress_depth.into(),
                self.use_secondary_compression.into(),
                self.allow_seq_override.into(),
            ],
        )
        .map_err(spi_err)?;
        crate::shmem::CONFIG_GENERATION
            .get()
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub fn load(relid: pg_sys::Oid) -> Result<Option<Self>, StrataError> {
        Spi::connect(|client| {
            let table = client
                .select(
                    "SELECT relid, group_column, order_column, delta_columns, \
                     keyframe_interval, compress_depth, use_secondary_compression, \
                     allow_seq_override \
                     FROM pgstrata.strata_relations WHERE relid = $1",
                    None,
                    &[relid.into()],
                )
                .map_err(spi_err)?;
            if table.is_empty() {
                return Ok(None);
            }
            Ok(Some(Self::from_row(&table.first())?))
        })
    }

    /// Remove the configuration row, e.g. on relation drop (spec §3
    /// "configuration ... is dropped via a drop-event hook").
    pub fn drop_for_relation(relid: pg_sys::Oid) -> Result<(), StrataError> {
        Spi::run_with_args(
            "DELETE FROM pgstrata.strata_relations WHERE relid = $1",
            &[relid.into()],
        )
        .map_err(spi_err)?;
        crate::shmem::CONFIG_GENERATION
            .get()
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

fn spi_err(e: pgrx::spi::SpiError) -> StrataError {
    StrataError::SpiError(e.to_string())
}

// ── Per-backend config cache (component J) ─────────────────────────────

thread_local! {
    static CACHE: RefCell<HashMap<u32, (u64, RelationConfig)>> = RefCell::new(HashMap::new());
}

/// Per-backend cache of `strata_relations`, keyed by relation OID, lazily
/// populated on first use and invalidated whenever `CONFIG_GENERATION`
/// (bumped by `upsert`/`drop_for_relation`) advances past the generation
/// the cached entry was read at — mirroring the teacher's per-backend
/// catalog cache for `StreamTableMeta`.
pub struct ConfigRegistry;

impl ConfigRegistry {
    /// Fetch the configuration for `relid`, consulting the per-backend
    /// cache first. Returns `Err(ConfigMissingOnInsert)` if the relation was
    /// never configured.
    pub fn get(relid: pg_sys::Oid) -> Result<RelationConfig, StrataError> {
        let oid = relid.to_u32();
        let current_gen = crate::shmem::CONFIG_GENERATION
            .get()
            .load(std::sync::atomic::Ordering::Relaxed);

        if let Some(cfg) = CACHE.with(|c| {
            c.borrow()
                .get(&oid)
                .filter(|(gen, _)| *gen == current_gen)
                .map(|(_, cfg)| cfg.clone())
        }) {
            return Ok(cfg);
        }

        let cfg = RelationConfig::load(relid)?.ok_or_else(|| {
            StrataError::ConfigMissingOnInsert(relation_name(relid))
        })?;
        CACHE.with(|c| {
            c.borrow_mut().insert(oid, (current_gen, cfg.clone()));
        });
        Ok(cfg)
    }

    /// Drop a single relation's cache entry, e.g. right after this backend
    /// itself called `configure()` or dropped the relation, so it doesn't
    /// need to wait for its own generation bump to be observed.
    pub fn invalidate(relid: pg_sys::Oid) {
        CACHE.with(|c| {
            c.borrow_mut().remove(&relid.to_u32());
        });
    }

    pub fn invalidate_all() {
        CACHE.with(|c| c.borrow_mut().clear());
    }
}

/// Public wrapper around [`relation_name`] for callers outside this module
/// (e.g. `src/tableam.rs` building an `UpdateNotSupported`/
/// `VacuumFullNotSupported` error message).
pub fn relation_name_pub(relid: pg_sys::Oid) -> String {
    relation_name(relid)
}

fn relation_name(relid: pg_sys::Oid) -> String {
    // SAFETY: get_rel_name is safe to call with any OID; returns a
    // null-terminated C string owned by the catalog cache, or null if the
    // relation doesn't exist (e.g. already dropped).
    unsafe {
        let name_ptr = pg_sys::get_rel_name(relid);
        if name_ptr.is_null() {
            format!("<oid {}>", relid.to_u32())
        } else {
            std::ffi::CStr::from_ptr(name_ptr)
                .to_string_lossy()
                .into_owned()
        }
    }
}

// ── Configuration validation (component J) ─────────────────────────────

/// Integer/timestamp OIDs accepted for the order column (spec §3: "the
/// order column must be an integer or timestamp type").
fn is_valid_order_column_type(typ: pg_sys::Oid) -> bool {
    matches!(
        typ,
        pg_sys::INT2OID
            | pg_sys::INT4OID
            | pg_sys::INT8OID
            | pg_sys::TIMESTAMPOID
            | pg_sys::TIMESTAMPTZOID
            | pg_sys::DATEOID
    )
}

struct ColumnInfo {
    type_oid: pg_sys::Oid,
    type_name: String,
    not_null: bool,
}

fn lookup_column(relid: pg_sys::Oid, column: &str) -> Result<Option<ColumnInfo>, StrataError> {
    Spi::connect(|client| {
        let table = client
            .select(
                "SELECT a.atttypid, format_type(a.atttypid, a.atttypmod) AS type_name, \
                 a.attnotnull \
                 FROM pg_catalog.pg_attribute a \
                 WHERE a.attrelid = $1 AND a.attname = $2 AND a.attnum > 0 AND NOT a.attisdropped",
                None,
                &[relid.into(), column.into()],
            )
            .map_err(spi_err)?;
        if table.is_empty() {
            return Ok(None);
        }
        let row = table.first();
        let type_oid: pg_sys::Oid = row
            .get_by_name("atttypid")
            .map_err(spi_err)?
            .ok_or_else(|| StrataError::InternalError("pg_attribute.atttypid NULL".into()))?;
        let type_name: String = row.get_by_name("type_name").map_err(spi_err)?.unwrap_or_default();
        let not_null: bool = row.get_by_name("attnotnull").map_err(spi_err)?.unwrap_or(false);
        Ok(Some(ColumnInfo {
            type_oid,
            type_name,
            not_null,
        }))
    })
}

/// Validate a proposed configuration (spec §4.J): group/order/delta columns
/// exist, delta columns are non-nullable, the order column's type is
/// integer or timestamp, and `K`/`D` are both ≥ 1. Returns the validated
/// column list so the caller doesn't need to re-query.
pub fn validate_configuration(
    relid: pg_sys::Oid,
    group_column: Option<&str>,
    order_column: &str,
    delta_columns: &[String],
    keyframe_interval: i32,
    compress_depth: i32,
) -> Result<(), StrataError> {
    let relname = relation_name(relid);

    if keyframe_interval < 1 {
        return Err(StrataError::InvalidArgument(format!(
            "keyframe_every must be >= 1, got {keyframe_interval}"
        )));
    }
    if compress_depth < 1 {
        return Err(StrataError::InvalidArgument(format!(
            "compress_depth must be >= 1, got {compress_depth}"
        )));
    }
    if compress_depth > crate::config::max_compress_depth() {
        return Err(StrataError::InvalidArgument(format!(
            "compress_depth {compress_depth} exceeds pg_strata.max_compress_depth"
        )));
    }
    if delta_columns.is_empty() {
        // Open Question §9 resolution: no delta columns means there is
        // nothing for this engine to do.
        return Err(StrataError::InvalidArgument(
            "delta_columns must list at least one column".into(),
        ));
    }
    if delta_columns.len() as i32 > crate::config::max_delta_columns() {
        return Err(StrataError::InvalidArgument(format!(
            "{} delta columns exceeds pg_strata.max_delta_columns",
            delta_columns.len()
        )));
    }

    if let Some(group_col) = group_column {
        lookup_column(relid, group_col)?
            .ok_or_else(|| StrataError::UnknownColumn(group_col.to_string(), relname.clone()))?;
    }

    let order_info = lookup_column(relid, order_column)?
        .ok_or_else(|| StrataError::UnknownColumn(order_column.to_string(), relname.clone()))?;
    if !is_valid_order_column_type(order_info.type_oid) {
        return Err(StrataError::BadOrderColumnType(
            order_column.to_string(),
            order_info.type_name,
        ));
    }

    for col in delta_columns {
        let info = lookup_column(relid, col)?
            .ok_or_else(|| StrataError::UnknownColumn(col.clone(), relname.clone()))?;
        if !info.not_null {
            return Err(StrataError::NullInDeltaColumn(col.clone()));
        }
    }

    Ok(())
}

// ── Group stats persistence (component H's sink) ───────────────────────

/// A fully materialized `group_stats` row (spec §3 "Group stats row").
#[derive(Debug, Clone, Default)]
pub struct GroupStatsRow {
    pub fingerprint: Fingerprint,
    pub row_count: i64,
    pub keyframe_count: i64,
    pub max_seq: i64,
    pub raw_size_bytes: i64,
    pub compressed_size_bytes: i64,
    pub sum_avg_delta_tags: i64,
}

/// Flush a transaction's accumulated per-group deltas in one batched
/// upsert, O(groups) regardless of row count (spec §4.H). Called from the
/// pre-commit hook (`src/hooks.rs`).
pub fn flush_stats(relid: pg_sys::Oid, deltas: Vec<((u32, Fingerprint), DeltaStats)>) -> Result<(), StrataError> {
    if deltas.is_empty() {
        return Ok(());
    }

    let n = deltas.len();
    let mut fingerprints: Vec<Vec<u8>> = Vec::with_capacity(n);
    let mut row_counts: Vec<i64> = Vec::with_capacity(n);
    let mut keyframe_counts: Vec<i64> = Vec::with_capacity(n);
    let mut max_seqs: Vec<i64> = Vec::with_capacity(n);
    let mut raw_sizes: Vec<i64> = Vec::with_capacity(n);
    let mut compressed_sizes: Vec<i64> = Vec::with_capacity(n);
    let mut sum_tags: Vec<i64> = Vec::with_capacity(n);

    for ((rel, fp), delta) in deltas {
        debug_assert_eq!(rel, relid.to_u32());
        fingerprints.push(fp.to_vec());
        row_counts.push(delta.row_count);
        keyframe_counts.push(delta.keyframe_count);
        max_seqs.push(delta.max_seq as i64);
        raw_sizes.push(delta.raw_size_bytes);
        compressed_sizes.push(delta.compressed_size_bytes);
        sum_tags.push(delta.sum_tags);
    }

    Spi::run_with_args(
        "INSERT INTO pgstrata.group_stats \
         (relid, fingerprint, row_count, keyframe_count, max_seq, raw_size_bytes, \
          compressed_size_bytes, sum_avg_delta_tags) \
         SELECT $1, fp, rc, kc, GREATEST(ms, 0), rs, cs, st \
         FROM unnest($2::bytea[], $3::bigint[], $4::bigint[], $5::bigint[], \
                      $6::bigint[], $7::bigint[], $8::bigint[]) \
              AS u(fp, rc, kc, ms, rs, cs, st) \
         ON CONFLICT (relid, fingerprint) DO UPDATE SET \
           row_count = pgstrata.group_stats.row_count + EXCLUDED.row_count, \
           keyframe_count = pgstrata.group_stats.keyframe_count + EXCLUDED.keyframe_count, \
           max_seq = GREATEST(pgstrata.group_stats.max_seq, EXCLUDED.max_seq), \
           raw_size_bytes = pgstrata.group_stats.raw_size_bytes + EXCLUDED.raw_size_bytes, \
           compressed_size_bytes = pgstrata.group_stats.compressed_size_bytes + EXCLUDED.compressed_size_bytes, \
           sum_avg_delta_tags = pgstrata.group_stats.sum_avg_delta_tags + EXCLUDED.sum_avg_delta_tags",
        &[
            relid.into(),
            fingerprints.into(),
            row_counts.into(),
            keyframe_counts.into(),
            max_seqs.into(),
            raw_sizes.into(),
            compressed_sizes.into(),
            sum_tags.into(),
        ],
    )
    .map_err(spi_err)?;
    Ok(())
}

/// Aggregate table-level stats derived from per-group rows on query (spec
/// §4.H: "no separate table-level cache").
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub group_count: i64,
    pub row_count: i64,
    pub keyframe_count: i64,
    pub raw_size_bytes: i64,
    pub compressed_size_bytes: i64,
    pub avg_delta_tag: f64,
}

pub fn aggregate_stats(relid: pg_sys::Oid) -> Result<TableStats, StrataError> {
    Spi::connect(|client| {
        let table = client
            .select(
                "SELECT count(*) AS group_count, \
                        COALESCE(sum(row_count), 0) AS row_count, \
                        COALESCE(sum(keyframe_count), 0) AS keyframe_count, \
                        COALESCE(sum(raw_size_bytes), 0) AS raw_size_bytes, \
                        COALESCE(sum(compressed_size_bytes), 0) AS compressed_size_bytes, \
                        COALESCE(sum(sum_avg_delta_tags), 0) AS sum_tags \
                 FROM pgstrata.group_stats WHERE relid = $1",
                None,
                &[relid.into()],
            )
            .map_err(spi_err)?;
        let row = table.first();
        let group_count: i64 = row.get_by_name("group_count").map_err(spi_err)?.unwrap_or(0);
        let row_count: i64 = row.get_by_name("row_count").map_err(spi_err)?.unwrap_or(0);
        let keyframe_count: i64 = row.get_by_name("keyframe_count").map_err(spi_err)?.unwrap_or(0);
        let raw_size_bytes: i64 = row.get_by_name("raw_size_bytes").map_err(spi_err)?.unwrap_or(0);
        let compressed_size_bytes: i64 = row
            .get_by_name("compressed_size_bytes")
            .map_err(spi_err)?
            .unwrap_or(0);
        let sum_tags: i64 = row.get_by_name("sum_tags").map_err(spi_err)?.unwrap_or(0);
        let avg_delta_tag = if row_count > keyframe_count {
            sum_tags as f64 / (row_count - keyframe_count).max(1) as f64
        } else {
            0.0
        };
        Ok(TableStats {
            group_count,
            row_count,
            keyframe_count,
            raw_size_bytes,
            compressed_size_bytes,
            avg_delta_tag,
        })
    })
}

/// Delete every `group_stats` row for a relation (TRUNCATE / DROP).
pub fn drop_stats_for_relation(relid: pg_sys::Oid) -> Result<(), StrataError> {
    Spi::run_with_args(
        "DELETE FROM pgstrata.group_stats WHERE relid = $1",
        &[relid.into()],
    )
    .map_err(spi_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_order_column_type_accepts_integers_and_timestamps() {
        assert!(is_valid_order_column_type(pg_sys::INT4OID));
        assert!(is_valid_order_column_type(pg_sys::INT8OID));
        assert!(is_valid_order_column_type(pg_sys::TIMESTAMPOID));
        assert!(is_valid_order_column_type(pg_sys::TIMESTAMPTZOID));
        assert!(!is_valid_order_column_type(pg_sys::TEXTOID));
        assert!(!is_valid_order_column_type(pg_sys::BOOLOID));
    }
}
