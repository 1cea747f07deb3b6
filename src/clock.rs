//! Timestamp helpers. The perf-event clock domain and the boot clock used
//! for packet ordering are kept distinct per spec.md §5 ("Sample timestamps
//! use the perf-event clock; ring-buffer-loss and purge packets use boot
//! clock and are best-effort-ordered").

use crate::config::ClockId;

/// `protos::pbzero::BuiltinClock` equivalent. The actual wire encoding is
/// owned by the (external) trace serializer; we only need a stable,
/// totally-ordered tag to hand it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinClock {
    Realtime,
    Monotonic,
    MonotonicRaw,
    Boottime,
    Unknown,
}

/// spec.md §6: REALTIME→BUILTIN_REALTIME, MONOTONIC→BUILTIN_MONOTONIC,
/// MONOTONIC_RAW→BUILTIN_MONOTONIC_RAW, BOOTTIME→BUILTIN_BOOTTIME, else
/// UNKNOWN.
pub fn to_builtin_clock(clockid: ClockId) -> BuiltinClock {
    match clockid {
        ClockId::Realtime => BuiltinClock::Realtime,
        ClockId::Monotonic => BuiltinClock::Monotonic,
        ClockId::MonotonicRaw => BuiltinClock::MonotonicRaw,
        ClockId::Boottime => BuiltinClock::Boottime,
        ClockId::Other(_) => BuiltinClock::Unknown,
    }
}

/// Nanoseconds since boot, used to timestamp packets whose ordering only
/// needs to be "close enough" (ring-buffer-loss, guardrail stop), not
/// sample-accurate.
pub fn boot_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, fully-initialized out-parameter.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        log::warn!("clock_gettime(CLOCK_BOOTTIME) failed, falling back to 0");
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Converts a boot-clock nanosecond timestamp (as returned by
/// `boot_time_ns`) to milliseconds, for the read-tick phasing formula
/// (§4.2 step 8). Takes the timestamp rather than reading the clock again
/// so a single read of `boot_time_ns` drives both the packet timestamp and
/// the phasing calculation for the same tick.
pub fn ns_to_ms(boot_now_ns: u64) -> u64 {
    boot_now_ns / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_clocks() {
        assert_eq!(to_builtin_clock(ClockId::Realtime), BuiltinClock::Realtime);
        assert_eq!(
            to_builtin_clock(ClockId::MonotonicRaw),
            BuiltinClock::MonotonicRaw
        );
        assert_eq!(to_builtin_clock(ClockId::Other(99)), BuiltinClock::Unknown);
    }
}
