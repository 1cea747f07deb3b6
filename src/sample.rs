use crate::session::SessionId;
use libc::pid_t;

/// `PERF_RECORD_MISC_*` values the kernel tags a sample with, mapped onto
/// the trace's `Profiling::CpuMode`. spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Kernel,
    User,
    Hypervisor,
    GuestKernel,
    GuestUser,
    Unknown,
}

/// Mirrors `PERF_RECORD_MISC_{KERNEL,USER,HYPERVISOR,GUEST_KERNEL,
/// GUEST_USER}`, with an explicit catch-all so an unrecognized tag never
/// panics the read-tick path.
pub fn to_cpu_mode(raw_misc: u16) -> CpuMode {
    const PERF_RECORD_MISC_KERNEL: u16 = 1;
    const PERF_RECORD_MISC_USER: u16 = 2;
    const PERF_RECORD_MISC_HYPERVISOR: u16 = 3;
    const PERF_RECORD_MISC_GUEST_KERNEL: u16 = 4;
    const PERF_RECORD_MISC_GUEST_USER: u16 = 5;
    match raw_misc {
        PERF_RECORD_MISC_KERNEL => CpuMode::Kernel,
        PERF_RECORD_MISC_USER => CpuMode::User,
        PERF_RECORD_MISC_HYPERVISOR => CpuMode::Hypervisor,
        PERF_RECORD_MISC_GUEST_KERNEL => CpuMode::GuestKernel,
        PERF_RECORD_MISC_GUEST_USER => CpuMode::GuestUser,
        _ => CpuMode::Unknown,
    }
}

/// User-mode register snapshot handed to the unwinder. The concrete
/// register layout is architecture-specific and owned by the (external)
/// event reader; we only need to move it around as an opaque blob.
#[derive(Debug, Clone)]
pub struct RegisterSnapshot(pub Vec<u8>);

/// One sample pulled off a per-CPU perf ring buffer, spec.md §3.
#[derive(Debug, Clone)]
pub struct ParsedSample {
    pub cpu: u32,
    pub pid: pid_t,
    pub tid: pid_t,
    pub timestamp: u64,
    pub cpu_mode: u16,
    pub timebase_count: u64,
    /// Absent for a kernel worker thread (spec.md §4.4: "if `regs` absent,
    /// drop").
    pub regs: Option<RegisterSnapshot>,
    pub stack: Vec<u8>,
}

impl ParsedSample {
    pub fn is_kernel_thread(&self) -> bool {
        self.regs.is_none()
    }
}

/// An entry sitting in the unwinder's SPSC queue, spec.md §3.
#[derive(Debug, Clone)]
pub struct UnwindEntry {
    pub session_id: SessionId,
    pub sample: ParsedSample,
}

/// Mirrors the unwinder's `unwindstack::ErrorCode`, mapped 1:1 onto
/// `Profiling::UNWIND_ERROR_*` with an `Unknown` catch-all for codes this
/// producer doesn't recognize (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    None,
    MemoryInvalid,
    UnwindInfo,
    Unsupported,
    InvalidMap,
    MaxFramesExceeded,
    RepeatedFrame,
    InvalidElf,
    SystemCall,
    ThreadTimeout,
    ThreadDoesNotExist,
    Unknown,
}

/// A single resolved stack frame, opaque beyond what the trace needs.
#[derive(Debug, Clone)]
pub struct Frame {
    pub rel_pc: u64,
    pub build_id_idx: usize,
}

/// A sample after the (external) unwinder has resolved it, spec.md §3.
#[derive(Debug, Clone)]
pub struct CompletedSample {
    pub cpu: u32,
    pub pid: pid_t,
    pub tid: pid_t,
    pub timestamp: u64,
    pub cpu_mode: u16,
    pub timebase_count: u64,
    pub frames: Vec<Frame>,
    pub build_ids: Vec<String>,
    pub unwind_error: UnwindError,
}

/// Why a sample was emitted as a skipped-sample packet instead of a real
/// one, spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSkipReason {
    ReadStage,
    UnwindEnqueue,
    UnwindStage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cpu_mode_is_a_total_function() {
        assert_eq!(to_cpu_mode(0xffff), CpuMode::Unknown);
    }

    #[test]
    fn known_cpu_modes_map_1_to_1() {
        assert_eq!(to_cpu_mode(1), CpuMode::Kernel);
        assert_eq!(to_cpu_mode(2), CpuMode::User);
    }
}
