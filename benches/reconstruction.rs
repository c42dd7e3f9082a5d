//! Benchmarks for chain reconstruction (component G's `reconstruct_column`,
//! with component E's content cache warm and cold), varying chain depth and
//! keyframe interval. Pure Rust — no database required.
//!
//! Run with: `cargo bench --bench reconstruction`

use std::cell::RefCell;
use std::collections::HashMap;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pg_strata::error::StrataError;
use pg_strata::hash::Fingerprint;
use pg_strata::seq_cache::RowLocator;
use pg_strata::stats::StatsAccumulator;
use pg_strata::storage::{
    EncodeParams, PhysicalAccess, PhysicalRow, commit_insert, encode_insert, reconstruct_column,
};

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

fn drifting_payload(version: usize, size: usize) -> Vec<u8> {
    let mut buf = format!("{{\"version\":{version},\"body\":\"").into_bytes();
    buf.resize(buf.len() + size, b'a' + (version % 26) as u8);
    buf.extend_from_slice(b"\"}");
    buf
}

/// Build a chain of `n` rows for a fresh group/relation and return the
/// fixture plus the params used to address it.
fn build_chain(n: usize, k: i32, d: i32, payload_size: usize) -> (FakeAccess, EncodeParams) {
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
    for version in 0..n {
        let payload = drifting_payload(version, payload_size);
        let outcome = encode_insert(&params, &access, &[payload]).unwrap();
        let row = PhysicalRow {
            seq: outcome.seq,
            columns: outcome.columns.clone(),
        };
        let locator = access.write_row(row);
        commit_insert(&params, &mut stats, &outcome, locator);
    }
    (access, params)
}

/// Worst case: K large enough that the whole chain has one keyframe at the
/// start, so reconstructing the tail walks every intervening delta.
fn bench_reconstruct_worst_case_chain_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruct_worst_case_chain");

    for &depth in &[10usize, 50, 200] {
        let (access, params) = build_chain(depth, depth as i32 + 1, 1, 512);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let got = reconstruct_column(
                    params.relation,
                    &params.fingerprint,
                    &access,
                    black_box(depth as u64),
                    0,
                )
                .unwrap();
                black_box(got);
            });
        });
    }

    group.finish();
}

/// Bounded case: keyframe interval caps chain walk length regardless of
/// total row count, so reconstruction cost should stay flat as `n` grows.
fn bench_reconstruct_bounded_by_keyframe_interval(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruct_bounded_by_k");

    for &n in &[100usize, 1000, 5000] {
        let (access, params) = build_chain(n, 8, 2, 512);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let got = reconstruct_column(
                    params.relation,
                    &params.fingerprint,
                    &access,
                    black_box(n as u64),
                    0,
                )
                .unwrap();
                black_box(got);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reconstruct_worst_case_chain_walk,
    bench_reconstruct_bounded_by_keyframe_interval
);
criterion_main!(benches);
