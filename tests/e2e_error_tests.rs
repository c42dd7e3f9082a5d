//! End-to-end tests for the error taxonomy's user-facing edges: every
//! `StrataError::User`-kind variant should surface as a rejected statement,
//! not a panic or silent no-op.

mod e2e;

use e2e::E2eDb;

#[tokio::test]
async fn update_is_rejected() {
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("upd_docs", 3, 1).await;
    db.execute("INSERT INTO upd_docs (grp, version, payload) VALUES (1, 1, 'a')")
        .await;

    let err = db
        .try_execute("UPDATE upd_docs SET payload = 'b' WHERE grp = 1 AND version = 1")
        .await;
    assert!(err.is_err(), "UPDATE must be rejected on a strata-backed table");
}

#[tokio::test]
async fn null_in_delta_column_is_rejected() {
    let db = E2eDb::new().await.with_extension().await;
    db.execute("CREATE TABLE null_docs (grp int, version int, payload text) USING strata")
        .await;
    db.execute(
        "SELECT pgstrata.configure('null_docs'::regclass, 'version', ARRAY['payload'], group_by => 'grp')",
    )
    .await;

    let err = db
        .try_execute("INSERT INTO null_docs (grp, version, payload) VALUES (1, 1, NULL)")
        .await;
    assert!(err.is_err(), "NULL in a configured delta column must be rejected");
}

#[tokio::test]
async fn configure_on_unknown_column_is_rejected() {
    let db = E2eDb::new().await.with_extension().await;
    db.execute("CREATE TABLE unk_docs (grp int, version int, payload text NOT NULL) USING strata")
        .await;

    let err = db
        .try_execute(
            "SELECT pgstrata.configure('unk_docs'::regclass, 'version', ARRAY['nonexistent_column'], group_by => 'grp')",
        )
        .await;
    assert!(err.is_err(), "configuring an unknown delta column must be rejected");
}

#[tokio::test]
async fn configure_requires_explicit_delta_columns() {
    // Open Question resolution (see DESIGN.md): delta_columns has no
    // implicit "all remaining columns" default — callers must name them.
    let db = E2eDb::new().await.with_extension().await;
    db.execute("CREATE TABLE explicit_docs (grp int, version int, payload text NOT NULL) USING strata")
        .await;

    let err = db
        .try_execute(
            "SELECT pgstrata.configure('explicit_docs'::regclass, 'version', ARRAY[]::text[], group_by => 'grp')",
        )
        .await;
    assert!(err.is_err(), "empty delta_columns must be rejected, not treated as 'all columns'");
}

#[tokio::test]
async fn bad_order_column_type_is_rejected() {
    let db = E2eDb::new().await.with_extension().await;
    db.execute("CREATE TABLE bad_order_docs (grp int, version text, payload text NOT NULL) USING strata")
        .await;

    let err = db
        .try_execute(
            "SELECT pgstrata.configure('bad_order_docs'::regclass, 'version', ARRAY['payload'], group_by => 'grp')",
        )
        .await;
    assert!(err.is_err(), "a non-integer/non-timestamp order column must be rejected");
}

#[tokio::test]
async fn reconfiguring_an_already_configured_table_upserts_not_duplicates() {
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("reconf_docs", 1, 1).await;

    db.execute(
        "SELECT pgstrata.configure('reconf_docs'::regclass, 'version', ARRAY['payload'], \
         group_by => 'grp', keyframe_every => 5, compress_depth => 3)",
    )
    .await;

    let count: i64 = db
        .query_scalar(
            "SELECT count(*) FROM pgstrata.strata_relations r \
             JOIN pg_class c ON c.oid = r.relid WHERE c.relname = 'reconf_docs'",
        )
        .await;
    assert_eq!(count, 1, "reconfiguring must upsert, not duplicate, the catalog row");

    let keyframe_interval: i32 = db
        .query_scalar(
            "SELECT keyframe_interval FROM pgstrata.strata_relations r \
             JOIN pg_class c ON c.oid = r.relid WHERE c.relname = 'reconf_docs'",
        )
        .await;
    assert_eq!(keyframe_interval, 5);
}

#[tokio::test]
async fn vacuum_full_is_rejected() {
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("vac_docs", 3, 1).await;
    db.execute("INSERT INTO vac_docs (grp, version, payload) VALUES (1, 1, 'a')")
        .await;

    let err = db.try_execute("VACUUM FULL vac_docs").await;
    assert!(err.is_err(), "VACUUM FULL is not supported on a strata-backed table");
}
