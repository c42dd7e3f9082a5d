//! Schema-generator shim required by `cargo pgrx schema`/`package`: pgrx
//! links this tiny binary against the extension's `lib` target and walks
//! its linked SQL entity graph to emit `sql/pg_strata--*.sql`. Not invoked
//! directly; nothing here is pg_strata-specific.

fn main() {
    pgrx::pg_sql_graph_embed!();
}
