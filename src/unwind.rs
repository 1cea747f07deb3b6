//! The boundary with the (external) stack-unwinder worker thread, spec.md
//! §2/§5. The worker itself (dequeuing [`UnwindEntry`]s and resolving
//! stacks) lives outside this crate; this module only defines the queue
//! both sides share and the `post_*` operations the producer core issues
//! against it.

use crate::sample::UnwindEntry;
use crate::session::SessionId;
use crossbeam_queue::ArrayQueue;
use libc::pid_t;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded SPSC-ish queue of samples awaiting unwinding, plus the shared
/// "how many bytes of stack are currently enqueued" counter from spec.md
/// §5. The producer is the sole writer, the (external) unwind worker the
/// sole reader, so `ArrayQueue`'s lock-free push/pop gives us the "write
/// slot available" check from §4.4 without a mutex.
pub struct UnwindQueue {
    entries: ArrayQueue<UnwindEntry>,
    enqueued_footprint: AtomicU64,
}

impl UnwindQueue {
    pub fn with_capacity(capacity: usize) -> UnwindQueue {
        UnwindQueue {
            entries: ArrayQueue::new(capacity.max(1)),
            enqueued_footprint: AtomicU64::new(0),
        }
    }

    /// Producer side: attempts to place `entry` in the next write slot.
    /// Returns `Err(entry)` when the queue is full, mirroring
    /// `WriteView::valid == false` in the original; the caller emits a
    /// skipped-sample packet with `UNWIND_ENQUEUE` in that case instead of
    /// blocking.
    pub fn try_push(&self, entry: UnwindEntry) -> Result<(), UnwindEntry> {
        self.entries.push(entry)
    }

    /// Worker side: pops the next entry, if any.
    pub fn try_pop(&self) -> Option<UnwindEntry> {
        self.entries.pop()
    }

    /// Read before a push decision, per §4.4's footprint gate.
    pub fn enqueued_footprint(&self) -> u64 {
        self.enqueued_footprint.load(Ordering::Acquire)
    }

    /// Called by the producer immediately after a successful push.
    pub fn add_footprint(&self, n: u64) {
        self.enqueued_footprint.fetch_add(n, Ordering::AcqRel);
    }

    /// Called by the (external) worker as it completes/discards entries.
    pub fn sub_footprint(&self, n: u64) {
        self.enqueued_footprint.fetch_sub(n, Ordering::AcqRel);
    }
}

/// Operations the producer core issues against the unwind worker. The
/// worker's own internals (thread, per-pid unwind caches, descriptor
/// adoption) are out of scope; this trait is the seam.
pub trait UnwindWorker {
    fn queue(&self) -> &UnwindQueue;

    /// `PostStartDataSource`: register a new session with the worker.
    fn post_start_data_source(&self, session_id: SessionId, kernel_frames: bool);

    /// Wake the worker up after the producer has (likely) pushed samples.
    fn post_process_queue(&self);

    /// `PostInitiateDataSourceStop`: begin the orderly-stop cascade; the
    /// worker will eventually call back with `post_finish_data_source_stop`
    /// (modeled as a message into the producer's own mailbox, see
    /// [`crate::producer`]).
    fn post_initiate_data_source_stop(&self, session_id: SessionId);

    /// `PostPurgeDataSource`: abrupt, immediate teardown.
    fn post_purge_data_source(&self, session_id: SessionId);

    /// `PostRecordTimedOutProcDescriptors`: the pid's descriptor lookup
    /// expired; already-enqueued entries for it should be discarded.
    fn post_record_timed_out_proc_descriptors(&self, session_id: SessionId, pid: pid_t);

    /// `PostAdoptProcDescriptors`: hand off resolved `/proc/<pid>/{maps,mem}`
    /// descriptors for a pid the worker is already tracking for this
    /// session.
    fn post_adopt_proc_descriptors(
        &self,
        session_id: SessionId,
        pid: pid_t,
        maps_fd: RawFd,
        mem_fd: RawFd,
    );

    /// `PostClearCachedStatePeriodic`: schedule (or re-arm) the worker's own
    /// periodic cached-unwind-state clear for this session.
    fn post_clear_cached_state_periodic(&self, session_id: SessionId, period_ms: u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ParsedSample;

    fn entry(session_id: u64) -> UnwindEntry {
        UnwindEntry {
            session_id: SessionId(session_id),
            sample: ParsedSample {
                cpu: 0,
                pid: 1,
                tid: 1,
                timestamp: 0,
                cpu_mode: 0,
                timebase_count: 1,
                regs: None,
                stack: vec![0; 8],
            },
        }
    }

    #[test]
    fn push_fails_once_full() {
        let queue = UnwindQueue::with_capacity(2);
        assert!(queue.try_push(entry(1)).is_ok());
        assert!(queue.try_push(entry(2)).is_ok());
        assert!(queue.try_push(entry(3)).is_err());
    }

    #[test]
    fn footprint_tracks_pushes_and_pops() {
        let queue = UnwindQueue::with_capacity(4);
        queue.add_footprint(100);
        queue.add_footprint(50);
        assert_eq!(queue.enqueued_footprint(), 150);
        queue.sub_footprint(50);
        assert_eq!(queue.enqueued_footprint(), 100);
    }
}
