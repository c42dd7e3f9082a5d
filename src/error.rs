//! Error types for pg_strata.
//!
//! All fallible internal functions return `Result<T, StrataError>`. Errors
//! are converted to PostgreSQL errors only at the API/hook boundary via
//! `pgrx::error!()` / `ereport!()`.
//!
//! # Error Classification
//!
//! Errors are classified into six kinds (spec §7):
//! - **User** — bad input (UPDATE attempt, nullable delta column, unknown
//!   column, bad order-column type). Never retried, no state mutated.
//! - **Resource** — allocation/storage exhaustion. Surfaced; host rolls back.
//! - **Codec** — a specific candidate base was unusable. Never escapes the
//!   adapter; always resolved to a keyframe internally.
//! - **Consistency** — a base row is missing/unreachable during
//!   reconstruction. Treated as corruption, never silently papered over.
//! - **Concurrency** — advisory lock contention. Blocks, honors cancellation.
//! - **Internal** — invariant violations (sequence regression, checksum
//!   mismatch). Aborts the transaction.

use std::fmt;

/// Primary error type for the extension.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    // ── User errors ────────────────────────────────────────────────────
    /// UPDATE was attempted against a delta-compressed relation.
    #[error("UPDATE is not supported on delta-compressed relation {0}: append a new version instead")]
    UpdateNotSupported(String),

    /// A delta column received (or would receive) a NULL value.
    #[error("NULL not allowed in delta column \"{0}\"")]
    NullInDeltaColumn(String),

    /// A relation configured with a group column received a NULL group
    /// value (spec.md §7's error table entry for "NULL group value").
    #[error("NULL not allowed in group column \"{0}\"")]
    NullGroupValue(String),

    /// The group, order, or delta column name doesn't exist on the relation.
    #[error("unknown column \"{0}\" on relation {1}")]
    UnknownColumn(String, String),

    /// The order column's type is neither integer nor timestamp.
    #[error("order column \"{0}\" must be an integer or timestamp type, found {1}")]
    BadOrderColumnType(String, String),

    /// `configure()` was never called for this relation before first use.
    #[error("relation {0} is not configured for delta storage; call pgstrata.configure() first")]
    ConfigMissingOnInsert(String),

    /// `configure()` was called twice without an explicit drop/replace.
    #[error("relation {0} already has a delta-storage configuration")]
    DuplicateConfiguration(String),

    /// A caller-supplied argument was out of range or otherwise invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// VACUUM FULL was requested; rejected (see tableam Non-goals).
    #[error("VACUUM FULL is not supported on delta-compressed relation {0}")]
    VacuumFullNotSupported(String),

    // ── Resource errors ────────────────────────────────────────────────
    /// 64-bit sequence space exhausted for a group.
    #[error("sequence overflow in group (relation {0}): seq would exceed u64::MAX")]
    SequenceOverflow(u32),

    /// The persistent `group_stats`/configuration table write failed.
    #[error("resource exhausted flushing stats for relation {0}: {1}")]
    StatsFlushFailed(u32, String),

    // ── Codec errors (internal to §4.B; never surfaced to a caller) ───
    /// Every candidate base was rejected by the codec.
    #[error("codec: all candidate bases rejected, falling back to keyframe")]
    CodecAllBasesRejected,

    // ── Consistency errors ─────────────────────────────────────────────
    /// A delta row's base is missing or not visible to the reading snapshot.
    #[error("corruption: base row for seq={0} (base seq={1}) in relation {2} is missing or not visible")]
    BaseRowMissing(u64, u64, u32),

    /// A reconstructed payload failed a post-decode sanity check.
    #[error("corruption: reconstructed payload for seq={0} column {1} failed validation")]
    ReconstructionFailed(u64, String),

    // ── Concurrency errors ─────────────────────────────────────────────
    /// The per-fingerprint advisory lock could not be acquired before cancel.
    #[error("lock timeout acquiring advisory lock for fingerprint {0}")]
    LockTimeout(String),

    /// The caller's query was cancelled while waiting on a suspension point.
    #[error("cancelled")]
    Cancelled,

    // ── Internal errors ────────────────────────────────────────────────
    /// SPI call failed unexpectedly.
    #[error("SPI error: {0}")]
    SpiError(String),

    /// An invariant was violated (sequence regression, checksum mismatch).
    #[error("internal invariant violated: {0}")]
    InternalError(String),
}

impl StrataError {
    /// Classify the error for `ereport!` level / SQLSTATE selection.
    pub fn kind(&self) -> StrataErrorKind {
        match self {
            StrataError::UpdateNotSupported(_)
            | StrataError::NullInDeltaColumn(_)
            | StrataError::NullGroupValue(_)
            | StrataError::UnknownColumn(_, _)
            | StrataError::BadOrderColumnType(_, _)
            | StrataError::ConfigMissingOnInsert(_)
            | StrataError::DuplicateConfiguration(_)
            | StrataError::InvalidArgument(_)
            | StrataError::VacuumFullNotSupported(_) => StrataErrorKind::User,

            StrataError::SequenceOverflow(_) | StrataError::StatsFlushFailed(_, _) => {
                StrataErrorKind::Resource
            }

            StrataError::CodecAllBasesRejected => StrataErrorKind::Codec,

            StrataError::BaseRowMissing(_, _, _) | StrataError::ReconstructionFailed(_, _) => {
                StrataErrorKind::Consistency
            }

            StrataError::LockTimeout(_) | StrataError::Cancelled => StrataErrorKind::Concurrency,

            StrataError::SpiError(_) | StrataError::InternalError(_) => StrataErrorKind::Internal,
        }
    }

    /// Whether the backend should keep no partial state after this error —
    /// true for every kind except `Codec`, which never escapes §4.B.
    pub fn requires_full_rollback(&self) -> bool {
        !matches!(self.kind(), StrataErrorKind::Codec)
    }
}

/// Classification of error severity/kind, mirrors spec §7's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrataErrorKind {
    User,
    Resource,
    Codec,
    Consistency,
    Concurrency,
    Internal,
}

impl fmt::Display for StrataErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrataErrorKind::User => write!(f, "USER"),
            StrataErrorKind::Resource => write!(f, "RESOURCE"),
            StrataErrorKind::Codec => write!(f, "CODEC"),
            StrataErrorKind::Consistency => write!(f, "CONSISTENCY"),
            StrataErrorKind::Concurrency => write!(f, "CONCURRENCY"),
            StrataErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}
