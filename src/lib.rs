//! pg_strata — a pluggable table storage engine for PostgreSQL that
//! transparently delta-compresses versioned row data.
//!
//! Rows that only change a little version-to-version (event sourcing
//! tables, SCD2 dimensions, document revision history) are stored as a
//! small encoded patch against a nearby prior version instead of a full
//! copy, with periodic keyframes bounding reconstruction cost. Compression
//! is implemented as a genuine Table Access Method (`CREATE ACCESS METHOD
//! strata TYPE TABLE`, `src/tableam.rs`), not as triggers, so every
//! ordinary `INSERT`/`SELECT`/`DELETE` against a `USING strata` relation
//! goes through it transparently.
//!
//! # Safety
//! This extension uses `unsafe` code for PostgreSQL FFI calls via pgrx.
//! All unsafe blocks are documented with `// SAFETY:` comments.

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(dead_code)]

use pgrx::prelude::*;

mod api;
mod catalog;
pub mod codec;
mod config;
mod content_cache;
mod encode_pool;
pub mod error;
pub mod hash;
mod hooks;
mod insert_cache;
pub mod seq_cache;
mod shmem;
pub mod stats;
pub mod storage;
mod tableam;

::pgrx::pg_module_magic!();

// Declare the `pgstrata` schema so pgrx's SQL entity graph recognises it
// for `#[pg_extern(schema = "pgstrata")]` annotations.
#[pg_schema]
mod pgstrata {}

/// Extension initialization — called when the shared library is loaded.
///
/// Registers GUC variables unconditionally; registers shared memory only
/// when loaded via `shared_preload_libraries`, since that's the only mode
/// in which PostgreSQL lets an extension reserve shared memory before the
/// postmaster forks backends.
#[allow(non_snake_case)]
#[pg_guard]
pub extern "C-unwind" fn _PG_init() {
    config::register_gucs();
    hooks::register_stats_flush();

    // SAFETY: reading a global boolean PostgreSQL sets during startup,
    // before any extension code runs.
    let in_shared_preload = unsafe { pg_sys::process_shared_preload_libraries_in_progress };

    if in_shared_preload {
        shmem::init_shared_memory();
        log!("pg_strata: initialized (shared_preload_libraries)");
    } else {
        warning!(
            "pg_strata: loaded without shared_preload_libraries. \
             The shared content/insert caches and fingerprint lock table are \
             disabled; each backend falls back to process-local caching. Add \
             'pg_strata' to shared_preload_libraries in postgresql.conf for \
             full functionality."
        );
    }
}

// ── SQL migration for catalog tables ──────────────────────────────────

extension_sql!(
    r#"
CREATE SCHEMA IF NOT EXISTS pgstrata;

-- Component J: per-relation delta-storage configuration.
CREATE TABLE IF NOT EXISTS pgstrata.strata_relations (
    relid                      OID PRIMARY KEY,
    group_column               TEXT,
    order_column               TEXT NOT NULL,
    delta_columns              TEXT[] NOT NULL,
    keyframe_interval          INT NOT NULL DEFAULT 1,
    compress_depth             INT NOT NULL DEFAULT 1,
    use_secondary_compression  BOOLEAN NOT NULL DEFAULT FALSE,
    allow_seq_override         BOOLEAN NOT NULL DEFAULT FALSE,
    created_at                 TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Component H's persistent sink: one row per (relation, group).
CREATE TABLE IF NOT EXISTS pgstrata.group_stats (
    relid                   OID NOT NULL,
    fingerprint             BYTEA NOT NULL,
    row_count               BIGINT NOT NULL DEFAULT 0,
    keyframe_count          BIGINT NOT NULL DEFAULT 0,
    max_seq                 BIGINT NOT NULL DEFAULT 0,
    raw_size_bytes          BIGINT NOT NULL DEFAULT 0,
    compressed_size_bytes   BIGINT NOT NULL DEFAULT 0,
    sum_avg_delta_tags      BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (relid, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_group_stats_relid ON pgstrata.group_stats (relid);
"#,
    name = "pg_strata_catalog",
    bootstrap,
);

// ── Table access method registration (src/tableam.rs) ──────────────────
//
// `strata_tableam_handler` and `CREATE ACCESS METHOD strata ...` are
// registered directly in `src/tableam.rs`'s own `extension_sql!` block,
// next to the routine they install — the same "keep the SQL declaration
// beside the Rust it binds" layout the teacher uses for its event-trigger
// functions just below.

// ── Monitoring view ──────────────────────────────────────────────────────

extension_sql!(
    r#"
CREATE OR REPLACE VIEW pgstrata.pg_stat_strata_tables AS
SELECT
    r.relid,
    c.relname,
    n.nspname AS schema_name,
    r.group_column,
    r.order_column,
    r.delta_columns,
    r.keyframe_interval,
    r.compress_depth,
    r.use_secondary_compression,
    COALESCE(g.group_count, 0)              AS group_count,
    COALESCE(g.row_count, 0)                 AS row_count,
    COALESCE(g.keyframe_count, 0)            AS keyframe_count,
    COALESCE(g.raw_size_bytes, 0)            AS raw_size_bytes,
    COALESCE(g.compressed_size_bytes, 0)     AS compressed_size_bytes,
    CASE WHEN COALESCE(g.raw_size_bytes, 0) > 0
         THEN round(1.0 - (g.compressed_size_bytes::numeric / g.raw_size_bytes::numeric), 4)
         ELSE NULL
    END AS compression_ratio
FROM pgstrata.strata_relations r
JOIN pg_catalog.pg_class c ON c.oid = r.relid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN LATERAL (
    SELECT
        count(*)::bigint AS group_count,
        COALESCE(sum(row_count), 0)::bigint AS row_count,
        COALESCE(sum(keyframe_count), 0)::bigint AS keyframe_count,
        COALESCE(sum(raw_size_bytes), 0)::bigint AS raw_size_bytes,
        COALESCE(sum(compressed_size_bytes), 0)::bigint AS compressed_size_bytes
    FROM pgstrata.group_stats gs
    WHERE gs.relid = r.relid
) g ON true;
"#,
    name = "pg_strata_monitoring_view",
);

// ── Relation-drop event trigger (src/hooks.rs) ──────────────────────────

extension_sql!(
    r#"
CREATE FUNCTION pgstrata."_on_sql_drop"()
    RETURNS event_trigger
    LANGUAGE c
    AS 'MODULE_PATHNAME', 'pg_strata_on_sql_drop_wrapper';

CREATE EVENT TRIGGER pg_strata_drop_tracker
    ON sql_drop
    EXECUTE FUNCTION pgstrata._on_sql_drop();
"#,
    name = "pg_strata_event_triggers",
);
