//! Patch codec adapter (component B).
//!
//! A thin, fallible wrapper around a binary-diff codec, consumed as an
//! external black box (spec §1 explicitly keeps "the patch codec itself"
//! out of scope beyond this interface). Nothing else in the engine depends
//! on the codec's internals — swapping `encode`/`decode`'s implementation
//! is confined to this file.
//!
//! `encode` picks the best of up to D candidate bases by minimal output
//! size; `decode` reverses a single base/delta pair. Neither ever fails the
//! caller: a base the codec can't use is simply skipped, and if every base
//! is unusable (or no delta beats the raw payload) the adapter returns a
//! keyframe.

use crate::error::StrataError;

/// A candidate base row considered for delta-encoding: its distance in
/// sequence space from the row being encoded, and its (already
/// reconstructed) bytes.
pub struct CandidateBase {
    pub tag: u16,
    pub bytes: Vec<u8>,
}

/// The result of encoding a column's value: either a delta against a base
/// (`tag > 0`) or a keyframe (`tag == 0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeResult {
    pub tag: u16,
    pub bytes: Vec<u8>,
}

impl EncodeResult {
    pub fn is_keyframe(&self) -> bool {
        self.tag == 0
    }
}

/// One-byte wrapper prefix distinguishing whether the payload that follows
/// is zstd-compressed or raw. Present only when `use_secondary_compression`
/// is enabled for the relation.
const WRAP_RAW: u8 = 0;
const WRAP_ZSTD: u8 = 1;

/// Encode `target_bytes` against the best of `bases` (ordered however the
/// caller likes; all candidates are tried). Returns a keyframe if every
/// base is rejected by the codec, or if no delta is smaller than the raw
/// payload.
pub fn encode(
    bases: &[CandidateBase],
    target_bytes: &[u8],
    use_secondary_compression: bool,
) -> EncodeResult {
    let mut best: Option<(u16, Vec<u8>)> = None;

    for base in bases {
        match diff(&base.bytes, target_bytes) {
            // An empty target has no encoding that can be "smaller than the
            // raw payload" (the raw payload is already zero bytes), but a
            // delta must still be preferred over a keyframe so the version
            // chain keeps referencing its base (SPEC_FULL.md §8 boundary
            // behavior: empty-after-empty/non-empty must store a delta, not
            // be silently forced to a keyframe).
            Ok(delta) if target_bytes.is_empty() || delta.len() < target_bytes.len() => {
                if best.as_ref().is_none_or(|(_, b)| delta.len() < b.len()) {
                    best = Some((base.tag, delta));
                }
            }
            // Codec declined this base, or its delta wasn't smaller than
            // the raw payload: skip it, per spec §4.B / §7 ("Codec" row).
            _ => continue,
        }
    }

    match best {
        Some((tag, delta_bytes)) => {
            let bytes = maybe_compress(delta_bytes, use_secondary_compression);
            EncodeResult { tag, bytes }
        }
        None => EncodeResult {
            tag: 0,
            bytes: maybe_compress(target_bytes.to_vec(), use_secondary_compression),
        },
    }
}

/// Reconstruct a target payload from a single base and its stored delta
/// record. `tag == 0` records (keyframes) never reach this function; the
/// storage layer returns the stored bytes directly for those.
pub fn decode(base_bytes: &[u8], delta_bytes: &[u8]) -> Result<Vec<u8>, StrataError> {
    let raw = maybe_decompress(delta_bytes)?;
    patch(base_bytes, &raw)
}

fn maybe_compress(bytes: Vec<u8>, enabled: bool) -> Vec<u8> {
    if !enabled {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(WRAP_RAW);
        out.extend_from_slice(&bytes);
        return out;
    }
    match zstd::encode_all(&bytes[..], 3) {
        Ok(compressed) if compressed.len() + 1 < bytes.len() => {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(WRAP_ZSTD);
            out.extend_from_slice(&compressed);
            out
        }
        _ => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(WRAP_RAW);
            out.extend_from_slice(&bytes);
            out
        }
    }
}

fn maybe_decompress(wrapped: &[u8]) -> Result<Vec<u8>, StrataError> {
    let (tag, rest) = wrapped
        .split_first()
        .ok_or_else(|| StrataError::InternalError("empty delta record".into()))?;
    match *tag {
        WRAP_RAW => Ok(rest.to_vec()),
        WRAP_ZSTD => zstd::decode_all(rest)
            .map_err(|e| StrataError::InternalError(format!("zstd decode failed: {e}"))),
        other => Err(StrataError::InternalError(format!(
            "unknown delta wrapper tag {other}"
        ))),
    }
}

/// Run the binary-diff algorithm, producing a patch that reconstructs
/// `target` from `base`. Returns `Err` if the codec itself fails for this
/// base (treated by `encode` as "skip this base").
fn diff(base: &[u8], target: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut patch = Vec::new();
    qbsdiff::Bsdiff::new(base, target)
        .compression_level(6)
        .compare(std::io::Cursor::new(&mut patch))?;
    Ok(patch)
}

/// Apply a previously-produced patch to `base`, reproducing the original
/// target bytes.
fn patch(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, StrataError> {
    let mut out = Vec::new();
    let patcher = qbsdiff::Bspatch::new(delta)
        .map_err(|e| StrataError::InternalError(format!("bad delta record: {e}")))?;
    patcher
        .apply(base, std::io::Cursor::new(&mut out))
        .map_err(|e| StrataError::InternalError(format!("patch application failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_small_delta() {
        let base = b"the quick brown fox jumps over the lazy dog".to_vec();
        let target = b"the quick brown fox leaps over the lazy dog".to_vec();
        let result = encode(
            &[CandidateBase { tag: 1, bytes: base.clone() }],
            &target,
            false,
        );
        let decoded = decode(&base, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_keyframe_when_no_bases() {
        let target = b"hello world".to_vec();
        let result = encode(&[], &target, false);
        assert!(result.is_keyframe());
    }

    #[test]
    fn test_picks_smallest_delta_among_bases() {
        let close = b"version four text payload, nearly identical".to_vec();
        let far = b"something else entirely, unrelated content here".to_vec();
        let target = b"version four text payload, nearly identicals".to_vec();
        let result = encode(
            &[
                CandidateBase { tag: 3, bytes: far },
                CandidateBase { tag: 1, bytes: close.clone() },
            ],
            &target,
            false,
        );
        assert_eq!(result.tag, 1);
        let decoded = decode(&close, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let base = b"non-empty base".to_vec();
        let target: Vec<u8> = vec![];
        let result = encode(&[CandidateBase { tag: 1, bytes: base.clone() }], &target, false);
        let decoded = decode(&base, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_empty_after_empty_roundtrip() {
        let base: Vec<u8> = vec![];
        let target: Vec<u8> = vec![];
        let result = encode(&[CandidateBase { tag: 1, bytes: base.clone() }], &target, false);
        let decoded = decode(&base, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_empty_target_prefers_delta_over_keyframe() {
        // SPEC_FULL.md §8 scenario 3: an empty payload following a prior row
        // (empty or not) must still be stored as a delta referencing that
        // base, never forced to a keyframe just because nothing can beat a
        // zero-byte raw payload on size.
        let base = b"abcd".to_vec();
        let target: Vec<u8> = vec![];
        let result = encode(&[CandidateBase { tag: 1, bytes: base.clone() }], &target, false);
        assert!(!result.is_keyframe(), "expected a delta, got a keyframe");
        assert_eq!(result.tag, 1);
        let decoded = decode(&base, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_secondary_compression_roundtrips() {
        let base = vec![b'a'; 4096];
        let mut target = vec![b'a'; 4096];
        target[2048] = b'b';
        let result = encode(&[CandidateBase { tag: 1, bytes: base.clone() }], &target, true);
        let decoded = decode(&base, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }
}
