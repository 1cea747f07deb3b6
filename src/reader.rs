//! The per-CPU perf ring-buffer reader. This is an external collaborator
//! (spec.md §2): the actual `perf_event_open` syscall plumbing and mmap
//! ring parsing live outside this crate. We only define the boundary this
//! producer drives.

use crate::config::EventConfig;
use crate::sample::ParsedSample;

/// One per-CPU reader over a perf ring buffer.
pub trait EventReader {
    /// Pulls the next sample out of the mmapped ring, if any is available.
    /// `lost_cb` is invoked with the number of records lost since the last
    /// successful read, *before* the sample (if any) is returned.
    fn read_until_sample(&mut self, lost_cb: &mut dyn FnMut(u64)) -> Option<ParsedSample>;

    /// Enables event collection on this CPU.
    fn enable(&mut self);

    /// Disables event collection on this CPU (kernel stops producing new
    /// records; already-buffered ones can still be drained).
    fn disable(&mut self);

    /// The CPU this reader is bound to.
    fn cpu(&self) -> u32;
}

/// The (external) `perf_event_open` syscall wrapper, spec.md §1/§4.2 step
/// 4: configures one reader per CPU for a session, failing the whole
/// session if any CPU can't be set up.
pub trait ReaderFactory {
    fn create_reader(&self, cpu: u32, config: &EventConfig) -> Result<Box<dyn EventReader>, ()>;
}
