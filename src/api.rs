//! Administrative SQL surface (spec.md §6 "Administrative operations",
//! SPEC_FULL.md §6's expansion) — every function here is exposed in the
//! `pgstrata` schema and is how a caller configures a relation for
//! delta-compressed storage and inspects what the engine has done with it.
//!
//! None of these functions touch the write/read hot path (that's
//! `src/tableam.rs` and `src/storage.rs`); they all go through SPI against
//! the relation's own heap and the `pgstrata.strata_relations`/
//! `pgstrata.group_stats` catalog tables.

use std::collections::HashMap;

use pgrx::prelude::*;

use crate::catalog::{self, RelationConfig};
use crate::codec;
use crate::content_cache;
use crate::error::StrataError;
use crate::hash::{self, Fingerprint};
use crate::insert_cache;
use crate::shmem;
use crate::stats::DeltaStats;
use crate::storage::StoredColumn;
use crate::tableam;

// ── configure / get_config ──────────────────────────────────────────────

/// Set or update a relation's delta-storage configuration (spec.md §6).
/// Re-running `configure()` on an already-configured relation replaces the
/// row rather than erroring — `RelationConfig::upsert` is an upsert by
/// design (see its own doc comment in `src/catalog.rs`).
#[pg_extern(schema = "pgstrata")]
#[allow(clippy::too_many_arguments)]
fn configure(
    relation: pg_sys::Oid,
    order_by: &str,
    delta_columns: Vec<String>,
    group_by: default!(Option<&str>, "NULL"),
    keyframe_every: default!(i32, 1),
    compress_depth: default!(i32, 1),
    use_secondary_compression: default!(bool, false),
    allow_seq_override: default!(bool, false),
) -> bool {
    match configure_impl(
        relation,
        group_by,
        order_by,
        delta_columns,
        keyframe_every,
        compress_depth,
        use_secondary_compression,
        allow_seq_override,
    ) {
        Ok(()) => true,
        Err(e) => pgrx::error!("{}", e),
    }
}

#[allow(clippy::too_many_arguments)]
fn configure_impl(
    relation: pg_sys::Oid,
    group_by: Option<&str>,
    order_by: &str,
    delta_columns: Vec<String>,
    keyframe_every: i32,
    compress_depth: i32,
    use_secondary_compression: bool,
    allow_seq_override: bool,
) -> Result<(), StrataError> {
    catalog::validate_configuration(
        relation,
        group_by,
        order_by,
        &delta_columns,
        keyframe_every,
        compress_depth,
    )?;

    let cfg = RelationConfig {
        relid: relation,
        group_column: group_by.map(str::to_string),
        order_column: order_by.to_string(),
        delta_columns,
        keyframe_interval: keyframe_every,
        compress_depth,
        use_secondary_compression,
        allow_seq_override,
    };
    cfg.upsert()?;
    catalog::ConfigRegistry::invalidate(relation);
    Ok(())
}

/// Return the current configuration for `relation`: one row if configured,
/// zero rows otherwise.
#[pg_extern(schema = "pgstrata")]
#[allow(clippy::type_complexity)]
fn get_config(
    relation: pg_sys::Oid,
) -> TableIterator<
    'static,
    (
        name!(group_column, Option<String>),
        name!(order_column, String),
        name!(delta_columns, Vec<String>),
        name!(keyframe_interval, i32),
        name!(compress_depth, i32),
        name!(use_secondary_compression, bool),
        name!(allow_seq_override, bool),
    ),
> {
    match RelationConfig::load(relation) {
        Ok(Some(cfg)) => TableIterator::once((
            cfg.group_column,
            cfg.order_column,
            cfg.delta_columns,
            cfg.keyframe_interval,
            cfg.compress_depth,
            cfg.use_secondary_compression,
            cfg.allow_seq_override,
        )),
        Ok(None) => TableIterator::empty(),
        Err(e) => pgrx::error!("{}", e),
    }
}

// ── stats / refresh_stats ────────────────────────────────────────────────

/// Aggregated per-relation stats (spec.md §6), derived from `group_stats` on
/// query rather than cached table-wide (spec §4.H: "no separate table-level
/// cache").
#[pg_extern(schema = "pgstrata")]
#[allow(clippy::type_complexity)]
fn stats(
    relation: pg_sys::Oid,
) -> TableIterator<
    'static,
    (
        name!(group_count, i64),
        name!(row_count, i64),
        name!(keyframe_count, i64),
        name!(raw_size_bytes, i64),
        name!(compressed_size_bytes, i64),
        name!(avg_delta_tag, f64),
        name!(compression_ratio, Option<f64>),
    ),
> {
    match catalog::aggregate_stats(relation) {
        Ok(s) => {
            let ratio = if s.raw_size_bytes > 0 {
                Some(1.0 - (s.compressed_size_bytes as f64 / s.raw_size_bytes as f64))
            } else {
                None
            };
            TableIterator::once((
                s.group_count,
                s.row_count,
                s.keyframe_count,
                s.raw_size_bytes,
                s.compressed_size_bytes,
                s.avg_delta_tag,
                ratio,
            ))
        }
        Err(e) => pgrx::error!("{}", e),
    }
}

/// Full rescan of `relation`'s physical rows, rewriting `group_stats` from
/// scratch (spec.md §6). Unlike the incremental accumulation
/// `src/tableam.rs`/`src/hooks.rs` perform per transaction, this recomputes
/// every counter directly from the heap — a repair tool for when the
/// incremental path drifted (e.g. an aborted flush).
#[pg_extern(schema = "pgstrata")]
fn refresh_stats(relation: pg_sys::Oid) -> bool {
    match refresh_stats_impl(relation) {
        Ok(()) => true,
        Err(e) => pgrx::error!("{}", e),
    }
}

fn refresh_stats_impl(relid: pg_sys::Oid) -> Result<(), StrataError> {
    let config = load_config(relid)?;
    let columns = scan_physical_columns(relid, &config, None, None)?;

    let mut deltas: HashMap<(u32, Fingerprint), DeltaStats> = HashMap::new();
    for col in &columns {
        let entry = deltas.entry((relid.to_u32(), col.fingerprint)).or_default();
        entry.row_count += 1;
        if col.stored.is_keyframe() {
            entry.keyframe_count += 1;
        }
        entry.max_seq = entry.max_seq.max(col.seq);
        let len = col.stored.encoded_len() as i64;
        entry.raw_size_bytes += len;
        entry.compressed_size_bytes += len;
        entry.sum_tags += stored_tag(&col.stored) as i64;
    }

    // Rewritten from an empty table rather than merged: flush_stats's
    // upsert is additive (ON CONFLICT DO UPDATE adds to the existing row),
    // which is exactly wrong for a full rescan's "this is the truth now".
    catalog::drop_stats_for_relation(relid)?;
    catalog::flush_stats(relid, deltas.into_iter().collect())?;
    Ok(())
}

// ── inspect / physical ───────────────────────────────────────────────────

/// Per-row diagnostic over a relation's delta columns (spec.md §6):
/// `seq, column_name, is_keyframe, tag, delta_size`. Scoped to one group
/// when `group_value` is given (compared against the group column as text),
/// otherwise covers the whole relation.
#[pg_extern(schema = "pgstrata")]
#[allow(clippy::type_complexity)]
fn inspect(
    relation: pg_sys::Oid,
    group_value: default!(Option<&str>, "NULL"),
) -> TableIterator<
    'static,
    (
        name!(seq, i64),
        name!(column_name, String),
        name!(is_keyframe, bool),
        name!(tag, i32),
        name!(delta_size, i64),
    ),
> {
    match inspect_impl(relation, group_value) {
        Ok(rows) => TableIterator::new(rows.into_iter().map(|r| {
            (
                r.seq as i64,
                r.col_name,
                r.stored.is_keyframe(),
                stored_tag(&r.stored) as i32,
                r.stored.encoded_len() as i64,
            )
        })),
        Err(e) => pgrx::error!("{}", e),
    }
}

fn inspect_impl(relid: pg_sys::Oid, group_value: Option<&str>) -> Result<Vec<ScannedColumn>, StrataError> {
    let config = load_config(relid)?;
    scan_physical_columns(relid, &config, group_value, None)
}

/// Raw delta-record dump for debugging (spec.md §6): same rows as
/// [`inspect`] plus the encoded payload bytes themselves, optionally
/// starting from a given `seq`. This is what `pg_strata_dump` (the
/// standalone CLI in `src/bin/`) drives.
#[pg_extern(schema = "pgstrata")]
#[allow(clippy::type_complexity)]
fn physical(
    relation: pg_sys::Oid,
    group_value: default!(Option<&str>, "NULL"),
    from_seq: default!(Option<i64>, "NULL"),
) -> TableIterator<
    'static,
    (
        name!(seq, i64),
        name!(column_name, String),
        name!(is_keyframe, bool),
        name!(tag, i32),
        name!(payload, Vec<u8>),
    ),
> {
    match physical_impl(relation, group_value, from_seq) {
        Ok(rows) => TableIterator::new(rows.into_iter().map(|r| {
            let (is_kf, tag, bytes) = match r.stored {
                StoredColumn::Keyframe(b) => (true, 0u16, b),
                StoredColumn::Delta { tag, bytes } => (false, tag, bytes),
            };
            (r.seq as i64, r.col_name, is_kf, tag as i32, bytes)
        })),
        Err(e) => pgrx::error!("{}", e),
    }
}

fn physical_impl(
    relid: pg_sys::Oid,
    group_value: Option<&str>,
    from_seq: Option<i64>,
) -> Result<Vec<ScannedColumn>, StrataError> {
    let config = load_config(relid)?;
    scan_physical_columns(relid, &config, group_value, from_seq)
}

// ── cache_stats / insert_cache_stats / reset_cache_stats ────────────────

/// Snapshot of the shared content cache's counters (component E).
#[pg_extern(schema = "pgstrata")]
fn cache_stats() -> TableIterator<
    'static,
    (
        name!(hits, i64),
        name!(misses, i64),
        name!(evictions, i64),
        name!(skips, i64),
        name!(entries, i64),
        name!(bytes, i64),
    ),
> {
    let s = content_cache::stats_snapshot();
    TableIterator::once((
        s.hits as i64,
        s.misses as i64,
        s.evictions as i64,
        s.skips as i64,
        s.entries as i64,
        s.bytes as i64,
    ))
}

/// Snapshot of the insert cache's counters (component D).
#[pg_extern(schema = "pgstrata")]
fn insert_cache_stats() -> TableIterator<
    'static,
    (
        name!(hits, i64),
        name!(misses, i64),
        name!(slots_in_use, i64),
        name!(evictions, i64),
    ),
> {
    let s = insert_cache::stats_snapshot();
    TableIterator::once((
        s.hits as i64,
        s.misses as i64,
        s.slots_in_use as i64,
        s.evictions as i64,
    ))
}

/// Zero the aggregated (E)/(D) counters without evicting entries
/// (SPEC_FULL.md §6 expansion — useful for benchmarking a warm cache from a
/// clean counter baseline).
#[pg_extern(schema = "pgstrata")]
fn reset_cache_stats() -> bool {
    if shmem::is_shmem_available() {
        *shmem::CONTENT_CACHE_STATS.exclusive() = shmem::ContentCacheGlobalStats::default();
        *shmem::INSERT_CACHE_STATS.exclusive() = shmem::InsertCacheGlobalStats::default();
    }
    true
}

// ── warm_cache ───────────────────────────────────────────────────────────

/// Drive a read-reconstruction scan over `relation` to populate the shared
/// content cache (component E) ahead of real query traffic (spec.md §6).
/// Returns the number of column values warmed. `max_rows`/`max_groups` cap
/// the work done in one call; `NULL` means unbounded.
#[pg_extern(schema = "pgstrata")]
fn warm_cache(
    relation: pg_sys::Oid,
    max_rows: default!(Option<i64>, "NULL"),
    max_groups: default!(Option<i64>, "NULL"),
) -> i64 {
    match warm_cache_impl(relation, max_rows, max_groups) {
        Ok(n) => n as i64,
        Err(e) => pgrx::error!("{}", e),
    }
}

fn warm_cache_impl(relid: pg_sys::Oid, max_rows: Option<i64>, max_groups: Option<i64>) -> Result<u64, StrataError> {
    let config = load_config(relid)?;
    let mut columns = scan_physical_columns(relid, &config, None, None)?;
    columns.sort_by(|a, b| (a.fingerprint, a.seq, a.col_idx).cmp(&(b.fingerprint, b.seq, b.col_idx)));

    let row_cap = max_rows.unwrap_or(i64::MAX).max(0) as u64;
    let group_cap = max_groups.unwrap_or(i64::MAX).max(0) as u64;

    let mut reconstructed: HashMap<(Fingerprint, u64, usize), Vec<u8>> = HashMap::new();
    let mut seen_groups: std::collections::HashSet<Fingerprint> = std::collections::HashSet::new();
    let mut warmed = 0u64;

    for col in columns {
        if warmed >= row_cap {
            break;
        }
        if !seen_groups.contains(&col.fingerprint) && seen_groups.len() as u64 >= group_cap {
            continue;
        }

        let bytes = match &col.stored {
            StoredColumn::Keyframe(b) => b.clone(),
            StoredColumn::Delta { tag, bytes } => {
                let base_seq = col.seq.saturating_sub(*tag as u64);
                let Some(base) = reconstructed.get(&(col.fingerprint, base_seq, col.col_idx)) else {
                    // Base outside this scan's window (shouldn't happen for
                    // a full-relation scan); skip rather than fail a
                    // best-effort warm.
                    continue;
                };
                match codec::decode(base, bytes) {
                    Ok(b) => b,
                    Err(_) => continue,
                }
            }
        };

        let key = content_cache::CacheKey {
            fingerprint: col.fingerprint,
            seq: col.seq,
            col_idx: col.col_idx as u16,
        };
        content_cache::insert(key, bytes.clone());
        reconstructed.insert((col.fingerprint, col.seq, col.col_idx), bytes);
        seen_groups.insert(col.fingerprint);
        warmed += 1;
        pgrx::check_for_interrupts!();
    }
    Ok(warmed)
}

fn stored_tag(col: &StoredColumn) -> u16 {
    match col {
        StoredColumn::Keyframe(_) => 0,
        StoredColumn::Delta { tag, .. } => *tag,
    }
}

fn load_config(relid: pg_sys::Oid) -> Result<RelationConfig, StrataError> {
    RelationConfig::load(relid)?.ok_or_else(|| StrataError::ConfigMissingOnInsert(relid.to_u32().to_string()))
}

// ── Physical scan engine shared by refresh_stats/inspect/physical/warm_cache ──

/// One delta column's decoded wire value for one physical row, as produced
/// by a SPI scan of the relation's own heap (not via `src/tableam.rs`'s
/// `PhysicalAccess`, since these are diagnostic/repair tools reading through
/// ordinary SQL rather than the write/read hot path).
struct ScannedColumn {
    fingerprint: Fingerprint,
    seq: u64,
    col_idx: usize,
    col_name: String,
    stored: StoredColumn,
}

/// Scan `relation`'s configured delta columns (plus `__strata_seq` and the
/// group column, if any), optionally filtered to one group value and/or a
/// minimum seq, decoding each column's wire bytes via the same
/// `(tag, payload)` format `src/tableam.rs` writes.
fn scan_physical_columns(
    relid: pg_sys::Oid,
    config: &RelationConfig,
    group_value: Option<&str>,
    from_seq: Option<i64>,
) -> Result<Vec<ScannedColumn>, StrataError> {
    let (schema, table) = relation_ident(relid)?;
    let qualified = format!("{}.{}", quote_identifier(&schema), quote_identifier(&table));

    let group_expr = config
        .group_column
        .as_ref()
        .map(|col| -> Result<(String, pg_sys::Oid), StrataError> {
            let typ = column_type(relid, col)?;
            Ok(group_select_expr(col, typ))
        })
        .transpose()?;

    let mut select_list = vec![format!("{} AS __seq", quote_identifier(tableam::SEQ_COLUMN_NAME))];
    if let Some((expr, _)) = &group_expr {
        select_list.push(format!("{expr} AS __group"));
    }
    for (i, col) in config.delta_columns.iter().enumerate() {
        select_list.push(format!("{} AS __delta_{i}", quote_identifier(col)));
    }

    let mut conditions = Vec::new();
    let bind_group = group_expr.is_some() && group_value.is_some();
    if bind_group {
        let (expr, _) = group_expr.as_ref().unwrap();
        conditions.push(format!("({expr})::text = $1"));
    }
    let bind_seq = from_seq.is_some();
    if bind_seq {
        let placeholder = if bind_group { "$2" } else { "$1" };
        conditions.push(format!(
            "{} >= {placeholder}",
            quote_identifier(tableam::SEQ_COLUMN_NAME)
        ));
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT {} FROM {} {} ORDER BY {}",
        select_list.join(", "),
        qualified,
        where_clause,
        quote_identifier(tableam::SEQ_COLUMN_NAME),
    );

    let mut out = Vec::new();
    Spi::connect(|client| -> Result<(), StrataError> {
        let rows = match (bind_group, bind_seq) {
            (true, true) => client
                .select(&sql, None, &[group_value.unwrap().into(), from_seq.unwrap().into()])
                .map_err(spi_err)?,
            (true, false) => client.select(&sql, None, &[group_value.unwrap().into()]).map_err(spi_err)?,
            (false, true) => client.select(&sql, None, &[from_seq.unwrap().into()]).map_err(spi_err)?,
            (false, false) => client.select(&sql, None, &[]).map_err(spi_err)?,
        };

        for row in rows {
            let seq: i64 = row.get_by_name("__seq").map_err(spi_err)?.unwrap_or(0);
            let fingerprint = match &group_expr {
                Some((_, typ)) => match extract_group_bytes(*typ, &row, "__group")? {
                    Some(bytes) => hash::fingerprint(&bytes, *typ),
                    None => hash::SINGLETON_GROUP_FINGERPRINT,
                },
                None => hash::SINGLETON_GROUP_FINGERPRINT,
            };

            for (i, col_name) in config.delta_columns.iter().enumerate() {
                let colname = format!("__delta_{i}");
                let wire: Vec<u8> = row.get_by_name(&colname).map_err(spi_err)?.unwrap_or_default();
                out.push(ScannedColumn {
                    fingerprint,
                    seq: seq.max(0) as u64,
                    col_idx: i,
                    col_name: col_name.clone(),
                    stored: tableam::decode_stored_column(wire),
                });
            }
            pgrx::check_for_interrupts!();
        }
        Ok(())
    })?;

    out.sort_by(|a, b| (a.seq, a.col_idx).cmp(&(b.seq, b.col_idx)));
    Ok(out)
}

/// Build the `SELECT` expression and effective type OID for a group column:
/// fixed-width integer types and text-like types are selected as-is (their
/// native SPI getter matches `extract_group_bytes` directly); everything
/// else (timestamps, dates, numerics, ...) is cast to text, so the
/// fingerprint computed for diagnostic scans for those types is over the
/// text representation rather than `hash::canonical_bytes`'s raw-byte form
/// the live insert path uses. An acknowledged approximation for this
/// debugging surface, not a correctness requirement of the write path.
fn group_select_expr(col: &str, typ: pg_sys::Oid) -> (String, pg_sys::Oid) {
    match typ {
        pg_sys::INT2OID | pg_sys::INT4OID | pg_sys::INT8OID | pg_sys::TEXTOID | pg_sys::VARCHAROID
        | pg_sys::BPCHAROID => (quote_identifier(col), typ),
        _ => (format!("{}::text", quote_identifier(col)), pg_sys::TEXTOID),
    }
}

fn extract_group_bytes(
    typ: pg_sys::Oid,
    row: &pgrx::spi::SpiHeapTupleData,
    colname: &str,
) -> Result<Option<Vec<u8>>, StrataError> {
    match typ {
        pg_sys::INT2OID => Ok(row
            .get_by_name::<i16>(colname)
            .map_err(spi_err)?
            .map(|v| v.to_le_bytes().to_vec())),
        pg_sys::INT4OID => Ok(row
            .get_by_name::<i32>(colname)
            .map_err(spi_err)?
            .map(|v| v.to_le_bytes().to_vec())),
        pg_sys::INT8OID => Ok(row
            .get_by_name::<i64>(colname)
            .map_err(spi_err)?
            .map(|v| v.to_le_bytes().to_vec())),
        _ => Ok(row.get_by_name::<String>(colname).map_err(spi_err)?.map(String::into_bytes)),
    }
}

fn column_type(relid: pg_sys::Oid, column: &str) -> Result<pg_sys::Oid, StrataError> {
    Spi::connect(|client| {
        let table = client
            .select(
                "SELECT atttypid FROM pg_catalog.pg_attribute \
                 WHERE attrelid = $1 AND attname = $2 AND attnum > 0 AND NOT attisdropped",
                None,
                &[relid.into(), column.into()],
            )
            .map_err(spi_err)?;
        if table.is_empty() {
            return Err(StrataError::UnknownColumn(column.to_string(), relid.to_u32().to_string()));
        }
        table
            .first()
            .get_by_name("atttypid")
            .map_err(spi_err)?
            .ok_or_else(|| StrataError::InternalError("pg_attribute.atttypid is NULL".into()))
    })
}

fn relation_ident(relid: pg_sys::Oid) -> Result<(String, String), StrataError> {
    Spi::connect(|client| {
        let table = client
            .select(
                "SELECT n.nspname, c.relname FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.oid = $1",
                None,
                &[relid.into()],
            )
            .map_err(spi_err)?;
        if table.is_empty() {
            return Err(StrataError::UnknownColumn(
                "<relation>".to_string(),
                relid.to_u32().to_string(),
            ));
        }
        let row = table.first();
        let schema: String = row.get_by_name("nspname").map_err(spi_err)?.unwrap_or_default();
        let name: String = row.get_by_name("relname").map_err(spi_err)?.unwrap_or_default();
        Ok((schema, name))
    })
}

fn spi_err(e: pgrx::spi::SpiError) -> StrataError {
    StrataError::SpiError(e.to_string())
}

/// Quote a SQL identifier (escape embedded double quotes).
fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
