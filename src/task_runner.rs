//! Single-threaded cooperative task scheduler, spec.md §5/§9. All session
//! and connection state is only ever touched from tasks drained out of
//! here; nothing in this module understands cancellation on its own:
//! every closure posted here is expected to carry its own weak self-handle
//! and no-op if its target has been torn down.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

struct ScheduledTask {
    due: Instant,
    seq: u64,
    task: Box<dyn FnOnce()>,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; flip the comparison so the earliest due
        // task (and, on a tie, the one posted first) sorts to the top.
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TaskRunner {
    queue: BinaryHeap<ScheduledTask>,
    next_seq: u64,
}

impl Default for TaskRunner {
    fn default() -> Self {
        TaskRunner::new()
    }
}

impl TaskRunner {
    pub fn new() -> TaskRunner {
        TaskRunner {
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn post_task(&mut self, task: impl FnOnce() + 'static) {
        self.post_delayed_task(0, task);
    }

    pub fn post_delayed_task(&mut self, delay_ms: u64, task: impl FnOnce() + 'static) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledTask {
            due: Instant::now() + Duration::from_millis(delay_ms),
            seq,
            task: Box::new(task),
        });
    }

    /// Pops every task due at or before `now`, in (due, posting-order).
    /// Deliberately returns them rather than invoking them directly: the
    /// caller holds the only mutable borrow of whatever the closures will
    /// need to re-borrow (the producer calls this with a RefCell scoped
    /// tightly around just this call, then runs the tasks after dropping
    /// the borrow, so a task rescheduling another task doesn't re-enter
    /// the same `RefCell::borrow_mut`).
    pub fn take_ready(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut ready = Vec::new();
        while let Some(top) = self.queue.peek() {
            if top.due > now {
                break;
            }
            ready.push(self.queue.pop().unwrap().task);
        }
        ready
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|t| t.due)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// spec.md §4.2 step 8: a small LCG standing in for the source's
/// `std::minstd_rand`, deterministic per session id so concurrent sessions
/// sharing a period don't all tick in lockstep (spec.md §8's "scheduled
/// read instants differ by a deterministic function of session id").
pub fn phase_offset_ms(session_id: u64, period_ms: u32) -> u32 {
    const MODULUS: u64 = 2_147_483_647; // 2^31 - 1, minstd_rand's modulus.
    const MULTIPLIER: u64 = 48_271; // minstd_rand's multiplier.
    if period_ms == 0 {
        return 0;
    }
    let seed = (session_id % MODULUS).max(1);
    let value = seed.wrapping_mul(MULTIPLIER) % MODULUS;
    (value % u64::from(period_ms)) as u32
}

/// spec.md §4.2 step 8 / §4.3: milliseconds until the next phased tick,
/// given the current wall clock in ms since boot.
pub fn next_tick_delay_ms(period_ms: u32, offset_ms: u32, wall_now_ms: u64) -> u32 {
    if period_ms == 0 {
        return 0;
    }
    let period = i64::from(period_ms);
    let rem = ((wall_now_ms as i64 - i64::from(offset_ms)) % period + period) % period;
    (period - rem) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn tasks_run_in_due_order() {
        let mut runner = TaskRunner::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        runner.post_delayed_task(50, move || o1.borrow_mut().push(2));
        let o2 = order.clone();
        runner.post_delayed_task(0, move || o2.borrow_mut().push(1));
        let now = Instant::now() + Duration::from_millis(100);
        for task in runner.take_ready(now) {
            task();
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn future_tasks_are_not_ready_yet() {
        let mut runner = TaskRunner::new();
        runner.post_delayed_task(1000, || {});
        assert!(runner.take_ready(Instant::now()).is_empty());
    }

    #[test]
    fn phase_offsets_differ_for_different_sessions() {
        let a = phase_offset_ms(1, 100);
        let b = phase_offset_ms(2, 100);
        assert_ne!(a, b);
        assert!(a < 100 && b < 100);
    }

    #[test]
    fn next_tick_delay_is_within_period() {
        let delay = next_tick_delay_ms(100, 30, 1000);
        assert!(delay <= 100);
    }
}
