//! End-to-end tests for the walkthrough scenarios in the specification's
//! worked-examples section, run against a real `USING strata` table.

mod e2e;

use e2e::E2eDb;

#[tokio::test]
async fn scenario_cascading_delete_keeps_only_surviving_prefix() {
    // group g=1, K=100, D=1: insert versions 1..4, delete version 2,
    // which must cascade to versions 3 and 4 (they chain through it as a
    // base) — only version 1 should remain visible and reconstructable.
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("cascade_docs", 100, 1).await;

    for (version, payload) in [(1, "a"), (2, "ab"), (3, "abc"), (4, "abcd")] {
        db.execute(&format!(
            "INSERT INTO cascade_docs (grp, version, payload) VALUES (1, {version}, '{payload}')"
        ))
        .await;
    }

    // spec.md §8 scenario 1 deletes a single row by its own version, not by
    // a `version >= 2` predicate — the cascade to seq 3 and 4 must come from
    // the table access method itself, not from the executor matching all
    // three rows directly.
    db.execute("DELETE FROM cascade_docs WHERE grp = 1 AND version = 2")
        .await;

    assert_eq!(db.count("cascade_docs").await, 1);
    let remaining: String = db
        .query_scalar("SELECT payload FROM cascade_docs WHERE grp = 1")
        .await;
    assert_eq!(remaining, "a");
}

#[tokio::test]
async fn scenario_keyframe_every_three_reports_correct_keyframe_count() {
    // K=3, 7 rows in one group: keyframes at version 1, 4, 7 -> 3 keyframes.
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("kf_docs", 3, 1).await;

    for version in 1..=7 {
        db.execute(&format!(
            "INSERT INTO kf_docs (grp, version, payload) VALUES (7, {version}, 'P{version}')"
        ))
        .await;
    }

    let (keyframe_count, row_count): (i64, i64) = sqlx::query_as(
        "SELECT s.keyframe_count, s.row_count FROM pgstrata.group_stats s \
         JOIN pgstrata.strata_relations r ON r.relid = s.relid \
         JOIN pg_class c ON c.oid = r.relid \
         WHERE c.relname = 'kf_docs'",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(row_count, 7);
    assert_eq!(keyframe_count, 3);

    for version in 1..=7 {
        let payload: String = db
            .query_scalar(&format!(
                "SELECT payload FROM kf_docs WHERE grp = 7 AND version = {version}"
            ))
            .await;
        assert_eq!(payload, format!("P{version}"));
    }
}

#[tokio::test]
async fn scenario_empty_payload_is_stored_and_reconstructed_exactly() {
    // Boundary behavior: an empty delta-column value must round-trip, not
    // be treated as NULL or silently skipped.
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("empty_docs", 100, 2).await;

    db.execute("INSERT INTO empty_docs (grp, version, payload) VALUES (1, 1, 'x')")
        .await;
    db.execute("INSERT INTO empty_docs (grp, version, payload) VALUES (1, 2, '')")
        .await;
    db.execute("INSERT INTO empty_docs (grp, version, payload) VALUES (1, 3, '')")
        .await;

    for version in 1..=3 {
        let payload: String = db
            .query_scalar(&format!(
                "SELECT payload FROM empty_docs WHERE grp = 1 AND version = {version}"
            ))
            .await;
        let expected = if version == 1 { "x" } else { "" };
        assert_eq!(payload, expected, "version {version}");
    }

    // Row 3 (empty after empty) must be stored as a delta referencing row 2,
    // not silently forced to a keyframe just because an empty payload can't
    // beat a zero-byte raw encoding on size (spec.md §8 scenario 3).
    let (seq3, is_keyframe3, tag3): (i64, bool, i32) = sqlx::query_as(
        "SELECT seq, is_keyframe, tag FROM pgstrata.inspect('empty_docs'::regclass) \
         WHERE seq = 3",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(seq3, 3);
    assert!(!is_keyframe3, "row 3 should be a delta, not a keyframe");
    assert_eq!(tag3, 1, "row 3's tag should reference row 2");
}

#[tokio::test]
async fn scenario_single_group_table_has_no_group_by_column() {
    // A relation configured without group_by is one implicit group whose
    // fingerprint is the singleton constant (spec §4.A).
    let db = E2eDb::new().await.with_extension().await;
    db.execute("CREATE TABLE singleton_docs (version int, payload text NOT NULL) USING strata")
        .await;
    db.execute(
        "SELECT pgstrata.configure('singleton_docs'::regclass, 'version', ARRAY['payload'])",
    )
    .await;

    db.execute("INSERT INTO singleton_docs (version, payload) VALUES (1, 'a')")
        .await;
    db.execute("INSERT INTO singleton_docs (version, payload) VALUES (2, 'ab')")
        .await;

    assert_eq!(db.count("singleton_docs").await, 2);
    let latest: String = db
        .query_scalar("SELECT payload FROM singleton_docs WHERE version = 2")
        .await;
    assert_eq!(latest, "ab");
}

#[tokio::test]
async fn scenario_inspect_reports_chain_depth_and_keyframe_flag() {
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("inspect_docs", 3, 1).await;

    for version in 1..=4 {
        db.execute(&format!(
            "INSERT INTO inspect_docs (grp, version, payload) VALUES (1, {version}, 'P{version}')"
        ))
        .await;
    }

    let rows: Vec<(i64, bool)> = sqlx::query_as(
        "SELECT seq, is_keyframe FROM pgstrata.inspect('inspect_docs'::regclass) ORDER BY seq",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0], (1, true));
    assert_eq!(rows[3], (4, true));
    assert_eq!(rows[1].1, false);
    assert_eq!(rows[2].1, false);
}
