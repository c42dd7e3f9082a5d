//! Stats accumulator (component H).
//!
//! Per-transaction, in-memory batched counters keyed by `(relation,
//! fingerprint)`. INSERT/DELETE update the accumulator directly; the
//! pre-commit hook flushes it to the persisted `pgstrata.group_stats` table
//! (component J's storage, see `src/catalog.rs`) in one batched upsert per
//! group, independent of row count — mirroring the teacher's
//! `pg_stat_stream_tables` refresh-history rollup, which is likewise
//! aggregated per relation rather than per row.

use std::collections::HashMap;

use crate::hash::Fingerprint;

/// Delta to apply to a group's persisted stats row. Positive fields for an
/// INSERT, negated for a DELETE, summed transaction-wide per group before
/// flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub row_count: i64,
    pub keyframe_count: i64,
    pub max_seq: u64,
    pub raw_size_bytes: i64,
    pub compressed_size_bytes: i64,
    pub sum_tags: i64,
}

impl DeltaStats {
    fn merge_insert(&mut self, is_keyframe: bool, seq: u64, raw_size: i64, compressed_size: i64, tag: u16) {
        self.row_count += 1;
        if is_keyframe {
            self.keyframe_count += 1;
        }
        self.max_seq = self.max_seq.max(seq);
        self.raw_size_bytes += raw_size;
        self.compressed_size_bytes += compressed_size;
        self.sum_tags += tag as i64;
    }

    fn merge_delete(&mut self, is_keyframe: bool, raw_size: i64, compressed_size: i64, tag: u16) {
        self.row_count -= 1;
        if is_keyframe {
            self.keyframe_count -= 1;
        }
        self.raw_size_bytes -= raw_size;
        self.compressed_size_bytes -= compressed_size;
        self.sum_tags -= tag as i64;
        // max_seq is never decremented on delete: a cascade always removes
        // the tail of the chain, so the surviving max_seq is recomputed
        // from the persisted row on next flush, not tracked incrementally
        // here (a negative delta merged additively would under-report it).
    }
}

/// Per-transaction accumulator. One instance lives for the duration of a
/// transaction and is handed to the pre-commit hook for flushing, then
/// discarded (a new one starts with the next transaction).
#[derive(Default)]
pub struct StatsAccumulator {
    deltas: HashMap<(u32, Fingerprint), DeltaStats>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_insert(
        &mut self,
        relation: u32,
        fp: Fingerprint,
        seq: u64,
        is_keyframe: bool,
        raw_size: usize,
        compressed_size: usize,
        tag: u16,
    ) {
        self.deltas
            .entry((relation, fp))
            .or_default()
            .merge_insert(is_keyframe, seq, raw_size as i64, compressed_size as i64, tag);
    }

    pub fn record_delete(
        &mut self,
        relation: u32,
        fp: Fingerprint,
        is_keyframe: bool,
        raw_size: usize,
        compressed_size: usize,
        tag: u16,
    ) {
        self.deltas
            .entry((relation, fp))
            .or_default()
            .merge_delete(is_keyframe, raw_size as i64, compressed_size as i64, tag);
    }

    /// Drop every pending delta for a relation without flushing, used when
    /// TRUNCATE within the same transaction makes accumulated deltas moot.
    pub fn discard_relation(&mut self, relation: u32) {
        self.deltas.retain(|(rel, _), _| *rel != relation);
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.deltas.len()
    }

    /// Drain the accumulator, returning one entry per touched group. Called
    /// by the pre-commit hook immediately before issuing the batched
    /// upsert; the accumulator is empty afterward.
    pub fn drain(&mut self) -> Vec<((u32, Fingerprint), DeltaStats)> {
        self.deltas.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(b: u8) -> Fingerprint {
        let mut f = [0u8; 16];
        f[0] = b;
        f
    }

    #[test]
    fn test_insert_accumulates_row_count_and_sizes() {
        let mut acc = StatsAccumulator::new();
        acc.record_insert(1, fp(1), 1, true, 100, 100, 0);
        acc.record_insert(1, fp(1), 2, false, 10, 4, 1);
        let drained = acc.drain();
        assert_eq!(drained.len(), 1);
        let (_, stats) = &drained[0];
        assert_eq!(stats.row_count, 2);
        assert_eq!(stats.keyframe_count, 1);
        assert_eq!(stats.max_seq, 2);
        assert_eq!(stats.raw_size_bytes, 110);
        assert_eq!(stats.compressed_size_bytes, 104);
        assert_eq!(stats.sum_tags, 1);
    }

    #[test]
    fn test_delete_subtracts() {
        let mut acc = StatsAccumulator::new();
        acc.record_insert(1, fp(1), 1, true, 100, 100, 0);
        acc.record_delete(1, fp(1), true, 100, 100, 0);
        let drained = acc.drain();
        let (_, stats) = &drained[0];
        assert_eq!(stats.row_count, 0);
        assert_eq!(stats.keyframe_count, 0);
        assert_eq!(stats.raw_size_bytes, 0);
    }

    #[test]
    fn test_groups_are_independent() {
        let mut acc = StatsAccumulator::new();
        acc.record_insert(1, fp(1), 1, true, 10, 10, 0);
        acc.record_insert(1, fp(2), 1, true, 20, 20, 0);
        assert_eq!(acc.group_count(), 2);
    }

    #[test]
    fn test_discard_relation_drops_only_that_relation() {
        let mut acc = StatsAccumulator::new();
        acc.record_insert(1, fp(1), 1, true, 10, 10, 0);
        acc.record_insert(2, fp(1), 1, true, 10, 10, 0);
        acc.discard_relation(1);
        let drained = acc.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.0, 2);
    }

    #[test]
    fn test_drain_empties_accumulator() {
        let mut acc = StatsAccumulator::new();
        acc.record_insert(1, fp(1), 1, true, 10, 10, 0);
        assert!(!acc.is_empty());
        acc.drain();
        assert!(acc.is_empty());
    }
}
