//! Trace-packet shapes and the per-session writer that sequences them,
//! spec.md §6. The actual protobuf wire encoding and shared-memory-buffer
//! mechanics are owned by the (external) trace serialization library;
//! [`PacketSink`] is the seam this crate writes logical packets through.

use crate::clock::BuiltinClock;
use crate::config::Timebase;
use crate::sample::{CpuMode, SampleSkipReason, UnwindError};
use bitflags::bitflags;

bitflags! {
    /// Mirrors `TracePacket::SequenceFlags`.
    pub struct SequenceFlags: u32 {
        const INCREMENTAL_STATE_CLEARED = 0b01;
        const NEEDS_INCREMENTAL_STATE   = 0b10;
    }
}

/// `trace_packet_defaults.perf_sample_defaults.timebase`, spec.md §6.
#[derive(Debug, Clone)]
pub struct TimebaseDefaults {
    pub freq_or_period: FreqOrPeriod,
    pub event: Timebase,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum FreqOrPeriod {
    Frequency(u64),
    Period(u64),
}

/// New callstack/frame/mapping entries a sample packet needs to carry
/// because this session hasn't emitted them yet on its sequence. The
/// actual frame/mapping table content is delegated to the interning
/// tracker against the shared trie (spec.md §4.8); here we just need to
/// know *that* something new must ride along.
#[derive(Debug, Clone, Default)]
pub struct InternedDataMarker {
    pub new_callstack_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PerfSamplePacket {
    pub cpu: u32,
    pub pid: i32,
    pub tid: i32,
    pub cpu_mode: CpuMode,
    pub timebase_count: u64,
    pub callstack_iid: Option<u64>,
    pub unwind_error: Option<UnwindError>,
}

#[derive(Debug, Clone)]
pub struct SkippedSamplePacket {
    pub cpu: u32,
    pub pid: i32,
    pub tid: i32,
    pub cpu_mode: CpuMode,
    pub timebase_count: u64,
    pub reason: SampleSkipReason,
}

#[derive(Debug, Clone)]
pub struct RingBufferLossPacket {
    pub cpu: u32,
    pub kernel_records_lost: u64,
}

/// `perf_sample.producer_event.source_stop_reason`, spec.md §4.7/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStopReason {
    Guardrail,
}

#[derive(Debug, Clone)]
pub enum PacketPayload {
    Defaults {
        trace_packet_defaults_clock: BuiltinClock,
        timebase: TimebaseDefaults,
    },
    Sample {
        sample: PerfSamplePacket,
        interned: InternedDataMarker,
    },
    SkippedSample(SkippedSamplePacket),
    RingBufferLoss(RingBufferLossPacket),
    ProducerStop(ProducerStopReason),
    /// The fixed interning entries emitted alongside the defaults packet on
    /// session start and on incremental-state clear, spec.md §4.2 step 6 /
    /// §4.9. Carries no session-specific payload of its own.
    FixedInterningData,
}

/// One logical trace packet, as the producer core sees it. `seq_no` is a
/// purely-local, per-session monotonic counter (useful for asserting
/// ordering in tests); it does not stand in for the real protobuf
/// packet-sequence mechanics, which the external writer owns.
#[derive(Debug, Clone)]
pub struct TracePacket {
    pub seq_no: u64,
    pub sequence_flags: SequenceFlags,
    pub timestamp: u64,
    pub timestamp_clock_id: Option<BuiltinClock>,
    pub payload: PacketPayload,
}

/// The (external) trace serializer/transport boundary: hands a logical
/// packet off to be encoded and placed in the session's shared buffer.
pub trait PacketSink {
    fn write_packet(&mut self, packet: TracePacket);

    /// Flushes any buffered packets. Called on orderly stop and on purge.
    fn flush(&mut self);
}

/// Creates a [`PacketSink`] bound to a service-assigned target buffer id,
/// spec.md §4.2 step 5. The actual shared-memory buffer allocation lives
/// in the (external) trace serialization library.
pub trait PacketSinkFactory {
    fn create_sink(&self, target_buffer: u32) -> Box<dyn PacketSink>;
}

/// A [`PacketSink`] that simply remembers every packet it was given, for
/// tests and for driving the literal end-to-end scenarios in spec.md §8.
#[derive(Default)]
pub struct RecordingSink {
    pub packets: Vec<TracePacket>,
    pub flush_count: u32,
}

impl PacketSink for RecordingSink {
    fn write_packet(&mut self, packet: TracePacket) {
        self.packets.push(packet);
    }

    fn flush(&mut self) {
        self.flush_count += 1;
    }
}

/// Per-session trace writer: owns the sink and the monotonic packet
/// sequence number for this session's buffer.
pub struct TraceWriter {
    sink: Box<dyn PacketSink>,
    next_seq_no: u64,
}

impl TraceWriter {
    pub fn new(sink: Box<dyn PacketSink>) -> TraceWriter {
        TraceWriter {
            sink,
            next_seq_no: 0,
        }
    }

    /// Starts (and immediately writes) a new packet with the given
    /// sequence flags, mirroring `StartTracePacket` in the original; there
    /// is no separate "handle" abstraction here since the sink owns
    /// serialization.
    pub fn write(
        &mut self,
        sequence_flags: SequenceFlags,
        timestamp: u64,
        timestamp_clock_id: Option<BuiltinClock>,
        payload: PacketPayload,
    ) {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        self.sink.write_packet(TracePacket {
            seq_no,
            sequence_flags,
            timestamp,
            timestamp_clock_id,
            payload,
        });
    }

    pub fn flush(&mut self) {
        self.sink.flush();
    }
}
