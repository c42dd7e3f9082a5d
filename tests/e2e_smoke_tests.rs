//! Smoke tests: the extension installs cleanly and its core SQL surface
//! exists, against the compiled `.so` in a real container.

mod e2e;

use e2e::E2eDb;

#[tokio::test]
async fn extension_installs_and_registers_access_method() {
    let db = E2eDb::new().await.with_extension().await;

    let am_exists: bool = db
        .query_scalar("SELECT EXISTS(SELECT 1 FROM pg_am WHERE amname = 'strata')")
        .await;
    assert!(am_exists, "strata access method must be registered");

    assert!(db.table_exists("pgstrata", "strata_relations").await);
    assert!(db.table_exists("pgstrata", "group_stats").await);

    let view_exists: bool = db
        .query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.views \
             WHERE table_schema = 'pgstrata' AND table_name = 'pg_stat_strata_tables')",
        )
        .await;
    assert!(view_exists);
}

#[tokio::test]
async fn create_table_using_strata_and_round_trip_a_row() {
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("docs", 3, 1).await;

    db.execute("INSERT INTO docs (grp, version, payload) VALUES (1, 1, 'hello')")
        .await;
    let payload: String = db
        .query_scalar("SELECT payload FROM docs WHERE grp = 1 AND version = 1")
        .await;
    assert_eq!(payload, "hello");
}

#[tokio::test]
async fn configure_is_visible_through_monitoring_view() {
    let db = E2eDb::new().await.with_extension().await;
    db.create_versioned_table("docs2", 3, 1).await;

    let keyframe_interval: i32 = db
        .query_scalar(
            "SELECT keyframe_interval FROM pgstrata.pg_stat_strata_tables \
             WHERE relname = 'docs2'",
        )
        .await;
    assert_eq!(keyframe_interval, 3);
}
