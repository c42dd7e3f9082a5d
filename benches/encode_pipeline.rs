//! Benchmarks for the encode pipeline (components B + G): diffing a new
//! value against a candidate base and writing the resulting chain, for
//! varying keyframe interval, compress depth, and payload size. All
//! operations are pure Rust — no database required.
//!
//! Run with: `cargo bench --bench encode_pipeline`

use std::cell::RefCell;
use std::collections::HashMap;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pg_strata::error::StrataError;
use pg_strata::hash::Fingerprint;
use pg_strata::seq_cache::RowLocator;
use pg_strata::stats::StatsAccumulator;
use pg_strata::storage::{EncodeParams, PhysicalAccess, PhysicalRow, commit_insert, encode_insert};

struct FakeAccess {
    rows: RefCell<HashMap<u64, PhysicalRow>>,
}

impl FakeAccess {
    fn new() -> Self {
        Self {
            rows: RefCell::new(HashMap::new()),
        }
    }

    fn write_row(&self, row: PhysicalRow) -> RowLocator {
        let locator = RowLocator {
            block: 0,
            offset: row.seq as u16,
        };
        self.rows.borrow_mut().insert(row.seq, row);
        locator
    }
}

impl PhysicalAccess for FakeAccess {
    fn fetch_by_seq(&self, seq: u64) -> Result<Option<(PhysicalRow, RowLocator)>, StrataError> {
        Ok(self.rows.borrow().get(&seq).cloned().map(|r| {
            (
                r,
                RowLocator {
                    block: 0,
                    offset: seq as u16,
                },
            )
        }))
    }

    fn fetch_by_locator(&self, locator: RowLocator) -> Result<Option<PhysicalRow>, StrataError> {
        Ok(self.rows.borrow().get(&(locator.offset as u64)).cloned())
    }

    fn write(&mut self, row: &PhysicalRow) -> Result<RowLocator, StrataError> {
        Ok(self.write_row(row.clone()))
    }
}

static NEXT_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

fn fresh_id() -> u32 {
    NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

fn fp(id: u32) -> Fingerprint {
    let mut f = [0u8; 16];
    f[..4].copy_from_slice(&id.to_le_bytes());
    f
}

/// JSON-ish document that drifts a little between versions: a realistic
/// stand-in for an SCD2/event-sourcing payload, rather than random bytes
/// that defeat the diff codec entirely.
fn drifting_payload(version: usize, size: usize) -> Vec<u8> {
    let mut buf = format!("{{\"version\":{version},\"body\":\"").into_bytes();
    buf.resize(buf.len() + size, b'a' + (version % 26) as u8);
    buf.extend_from_slice(b"\"}");
    buf
}

fn bench_insert_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_insert_chain");

    for &(k, d) in &[(1i32, 1i32), (10, 1), (10, 4), (100, 1)] {
        for &payload_size in &[64usize, 1024, 16384] {
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("k{k}_d{d}_{payload_size}b")),
                &(k, d, payload_size),
                |b, &(k, d, payload_size)| {
                    b.iter(|| {
                        let access = FakeAccess::new();
                        let id = fresh_id();
                        let params = EncodeParams {
                            relation: id,
                            fingerprint: fp(id),
                            keyframe_interval: k,
                            compress_depth: d,
                            use_secondary_compression: false,
                            num_delta_columns: 1,
                        };
                        let mut stats = StatsAccumulator::new();
                        for version in 0..50 {
                            let payload = drifting_payload(version, payload_size);
                            let outcome =
                                encode_insert(&params, &access, black_box(&[payload])).unwrap();
                            let row = PhysicalRow {
                                seq: outcome.seq,
                                columns: outcome.columns.clone(),
                            };
                            let locator = access.write_row(row);
                            commit_insert(&params, &mut stats, &outcome, locator);
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_secondary_compression_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_insert_secondary_compression");

    for use_zstd in [false, true] {
        group.bench_with_input(
            BenchmarkId::from_parameter(if use_zstd { "zstd" } else { "raw" }),
            &use_zstd,
            |b, &use_zstd| {
                b.iter(|| {
                    let access = FakeAccess::new();
                    let id = fresh_id();
                    let params = EncodeParams {
                        relation: id,
                        fingerprint: fp(id),
                        keyframe_interval: 20,
                        compress_depth: 2,
                        use_secondary_compression: use_zstd,
                        num_delta_columns: 1,
                    };
                    let mut stats = StatsAccumulator::new();
                    for version in 0..30 {
                        let payload = drifting_payload(version, 4096);
                        let outcome =
                            encode_insert(&params, &access, black_box(&[payload])).unwrap();
                        let row = PhysicalRow {
                            seq: outcome.seq,
                            columns: outcome.columns.clone(),
                        };
                        let locator = access.write_row(row);
                        commit_insert(&params, &mut stats, &outcome, locator);
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_insert_chain, bench_secondary_compression_overhead);
criterion_main!(benches);
