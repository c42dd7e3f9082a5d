//! Standalone CLI that dumps a relation's delta chain via the
//! `pgstrata.physical()`/`pgstrata.inspect()` admin functions (`src/api.rs`),
//! for operators who want to eyeball a chain outside of `psql`.
//!
//! ```text
//! pg_strata_dump --conn 'host=localhost user=postgres dbname=app' \
//!     --relation orders --group 42
//! ```

use std::process::ExitCode;

use postgres::{Client, NoTls};

struct Args {
    conn: String,
    relation: String,
    group: Option<String>,
    from_seq: Option<i64>,
    raw: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut conn = None;
    let mut relation = None;
    let mut group = None;
    let mut from_seq = None;
    let mut raw = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--conn" => conn = Some(it.next().ok_or("--conn requires a value")?),
            "--relation" => relation = Some(it.next().ok_or("--relation requires a value")?),
            "--group" => group = Some(it.next().ok_or("--group requires a value")?),
            "--from-seq" => {
                let v = it.next().ok_or("--from-seq requires a value")?;
                from_seq = Some(v.parse::<i64>().map_err(|_| "--from-seq must be an integer")?);
            }
            "--raw" => raw = true,
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }

    Ok(Args {
        conn: conn.ok_or("--conn is required")?,
        relation: relation.ok_or("--relation is required")?,
        group,
        from_seq,
        raw,
    })
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect(&args.conn, NoTls)?;

    if args.raw {
        let rows = client.query(
            "SELECT seq, column_name, is_keyframe, tag, payload \
             FROM pgstrata.physical($1::regclass, $2, $3)",
            &[&args.relation, &args.group, &args.from_seq],
        )?;
        println!("seq\tcolumn_name\tis_keyframe\ttag\tpayload_len");
        for row in &rows {
            let seq: i64 = row.get("seq");
            let column_name: String = row.get("column_name");
            let is_keyframe: bool = row.get("is_keyframe");
            let tag: i32 = row.get("tag");
            let payload: Vec<u8> = row.get("payload");
            println!("{seq}\t{column_name}\t{is_keyframe}\t{tag}\t{}", payload.len());
        }
    } else {
        let rows = client.query(
            "SELECT seq, column_name, is_keyframe, tag, delta_size \
             FROM pgstrata.inspect($1::regclass, $2)",
            &[&args.relation, &args.group],
        )?;
        println!("seq\tcolumn_name\tis_keyframe\ttag\tdelta_size");
        for row in &rows {
            let seq: i64 = row.get("seq");
            let column_name: String = row.get("column_name");
            let is_keyframe: bool = row.get("is_keyframe");
            let tag: i32 = row.get("tag");
            let delta_size: i64 = row.get("delta_size");
            println!("{seq}\t{column_name}\t{is_keyframe}\t{tag}\t{delta_size}");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pg_strata_dump: {e}");
            eprintln!(
                "usage: pg_strata_dump --conn <conninfo> --relation <name> \
                 [--group <value>] [--from-seq <n>] [--raw]"
            );
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(args) {
        eprintln!("pg_strata_dump: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
