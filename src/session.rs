//! Per-session lifecycle state, spec.md §3/§4.2-§4.4/§4.7-§4.9. A
//! [`SessionState`] owns its readers, writer, and process map exclusively;
//! the only thing it shares with the rest of the producer is the (passed
//! in by reference) callstack trie.

use crate::clock;
use crate::config::{SessionConfig, Timebase};
use crate::filter;
use crate::interning::{CallstackTrie, InterningTracker};
use crate::packets::{
    FreqOrPeriod, InternedDataMarker, PacketPayload, PerfSamplePacket, ProducerStopReason,
    RingBufferLossPacket, SequenceFlags, SkippedSamplePacket, TimebaseDefaults, TraceWriter,
};
use crate::process_state::ProcessTrackingStatus;
use crate::reader::EventReader;
use crate::sample::{CompletedSample, ParsedSample, SampleSkipReason, UnwindEntry, UnwindError};
use crate::unwind::UnwindWorker;
use libc::pid_t;
use std::collections::{HashMap, HashSet};

/// Opaque session identifier supplied by the service, spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    ShuttingDown,
}

/// What a freshly-observed pid's first sighting resolves to, and what the
/// read-tick loop should therefore do with the sample that triggered it.
enum PidDecision {
    Proceed,
    SkipReadStage,
    Drop,
}

pub struct SessionState {
    id: SessionId,
    config: SessionConfig,
    readers: Vec<Box<dyn EventReader>>,
    writer: TraceWriter,
    interning: InterningTracker,
    process_states: HashMap<pid_t, ProcessTrackingStatus>,
    additional_cmdlines: HashSet<String>,
    status: SessionStatus,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        readers: Vec<Box<dyn EventReader>>,
        writer: TraceWriter,
    ) -> SessionState {
        SessionState {
            id,
            config,
            readers,
            writer,
            interning: InterningTracker::new(),
            process_states: HashMap::new(),
            additional_cmdlines: HashSet::new(),
            status: SessionStatus::Active,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn process_status(&self, pid: pid_t) -> Option<ProcessTrackingStatus> {
        self.process_states.get(&pid).copied()
    }

    pub fn enable_all_readers(&mut self) {
        for reader in &mut self.readers {
            reader.enable();
        }
    }

    /// spec.md §4.7 ordered stop: disable events so the kernel stops
    /// producing; residual buffer contents still get drained by subsequent
    /// ticks.
    pub fn begin_ordered_stop(&mut self) {
        self.status = SessionStatus::ShuttingDown;
        for reader in &mut self.readers {
            reader.disable();
        }
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }

    // ---- process-state transitions (spec.md §3, §4.6) ----

    /// `on_proc_descriptors`: marks `pid` `Resolved` if it's currently
    /// `Resolving` or `Expired` in this session. Returns whether it matched
    /// (the producer uses this for first-fit routing across sessions).
    pub fn try_adopt_descriptors(&mut self, pid: pid_t) -> bool {
        match self.process_states.get(&pid).copied() {
            Some(ProcessTrackingStatus::Resolving) | Some(ProcessTrackingStatus::Expired) => {
                self.process_states
                    .insert(pid, ProcessTrackingStatus::Resolved);
                true
            }
            _ => false,
        }
    }

    /// `evaluate_descriptor_lookup_timeout`: if still `Resolving`, marks
    /// `Expired` and reports that the unwinder needs telling. A no-op (and
    /// `false`) if the pid already resolved or was never tracked.
    pub fn expire_if_resolving(&mut self, pid: pid_t) -> bool {
        if self.process_states.get(&pid).copied() == Some(ProcessTrackingStatus::Resolving) {
            self.process_states
                .insert(pid, ProcessTrackingStatus::Expired);
            true
        } else {
            false
        }
    }

    fn note_pid(
        &mut self,
        pid: pid_t,
        resolve_cmdline: &mut dyn FnMut(pid_t) -> Option<String>,
        on_new_pid_resolving: &mut dyn FnMut(pid_t),
    ) -> PidDecision {
        match self.process_states.get(&pid).copied() {
            Some(ProcessTrackingStatus::Expired) => PidDecision::SkipReadStage,
            Some(ProcessTrackingStatus::Rejected) => PidDecision::Drop,
            Some(ProcessTrackingStatus::Resolving) | Some(ProcessTrackingStatus::Resolved) => {
                PidDecision::Proceed
            }
            None => {
                let cmdline = resolve_cmdline(pid);
                let rejected = filter::evaluate(
                    pid,
                    cmdline.as_deref(),
                    &mut self.additional_cmdlines,
                    &self.config.filter,
                );
                if !rejected {
                    self.process_states
                        .insert(pid, ProcessTrackingStatus::Resolving);
                    on_new_pid_resolving(pid);
                    PidDecision::Proceed
                } else {
                    self.process_states
                        .insert(pid, ProcessTrackingStatus::Rejected);
                    PidDecision::Drop
                }
            }
        }
    }

    // ---- read tick / per-reader drain (spec.md §4.3/§4.4) ----

    /// Drains up to `samples_per_tick_limit` samples off one reader.
    /// Returns `true` if the reader likely still has more buffered (i.e.
    /// the per-tick cap was hit before the reader ran dry).
    #[allow(clippy::too_many_arguments)]
    pub fn drain_reader(
        &mut self,
        reader_idx: usize,
        unwind: &dyn UnwindWorker,
        resolve_cmdline: &mut dyn FnMut(pid_t) -> Option<String>,
        on_new_pid_resolving: &mut dyn FnMut(pid_t),
        boot_now_ns: u64,
    ) -> bool {
        let limit = self.config.samples_per_tick_limit;
        let cpu = self.readers[reader_idx].cpu();
        for _ in 0..limit {
            let mut lost_records = 0u64;
            let sample = self.readers[reader_idx].read_until_sample(&mut |n| lost_records = n);
            if lost_records > 0 {
                self.emit_ring_buffer_loss(cpu, lost_records, boot_now_ns);
            }
            let sample = match sample {
                Some(s) => s,
                None => return false,
            };

            if !self.config.sample_callstacks {
                self.emit_counter_sample(&sample);
                continue;
            }
            if sample.is_kernel_thread() {
                continue;
            }

            match self.note_pid(sample.pid, resolve_cmdline, on_new_pid_resolving) {
                PidDecision::Drop => continue,
                PidDecision::SkipReadStage => {
                    self.emit_skipped_sample(&sample, SampleSkipReason::ReadStage);
                    continue;
                }
                PidDecision::Proceed => {}
            }

            let stack_len = sample.stack.len() as u64;
            let footprint_limit = self.config.max_enqueued_footprint_bytes;
            if footprint_limit > 0 && unwind.queue().enqueued_footprint() + stack_len >= footprint_limit
            {
                self.emit_skipped_sample(&sample, SampleSkipReason::UnwindEnqueue);
                continue;
            }

            let entry = UnwindEntry {
                session_id: self.id,
                sample,
            };
            match unwind.queue().try_push(entry) {
                Ok(()) => unwind.queue().add_footprint(stack_len),
                Err(entry) => self.emit_skipped_sample(&entry.sample, SampleSkipReason::UnwindEnqueue),
            }
        }
        true
    }

    // ---- emit paths (spec.md §4.8) ----

    fn timebase_defaults(&self) -> TimebaseDefaults {
        let freq_or_period = if self.config.perf_attr.freq {
            FreqOrPeriod::Frequency(self.config.perf_attr.sample_freq)
        } else {
            FreqOrPeriod::Period(self.config.perf_attr.sample_period)
        };
        TimebaseDefaults {
            freq_or_period,
            event: self.config.timebase.clone(),
            name: self.config.timebase_name.clone(),
        }
    }

    /// Emitted on session start and on incremental-state clear, spec.md §6.
    pub fn emit_defaults_packet(&mut self, boot_now_ns: u64) {
        let clock_id = clock::to_builtin_clock(self.config.perf_attr.clockid);
        self.writer.write(
            SequenceFlags::INCREMENTAL_STATE_CLEARED,
            boot_now_ns,
            Some(clock::BuiltinClock::Boottime),
            PacketPayload::Defaults {
                trace_packet_defaults_clock: clock_id,
                timebase: self.timebase_defaults(),
            },
        );
    }

    /// `SEQ_NEEDS_INCREMENTAL_STATE` companion to the defaults packet,
    /// spec.md §4.2 step 6 / §4.9.
    pub fn emit_fixed_interning_packet(&mut self, boot_now_ns: u64) {
        self.writer.write(
            SequenceFlags::NEEDS_INCREMENTAL_STATE,
            boot_now_ns,
            None,
            PacketPayload::FixedInterningData,
        );
    }

    /// spec.md §4.9: re-emit defaults, drop this session's interning
    /// history, re-emit the fixed interning packet. The *shared* trie clear
    /// is the caller's job (producer-level, once per batch) since the trie
    /// outlives any one session.
    pub fn clear_incremental_state(&mut self, boot_now_ns: u64) {
        self.emit_defaults_packet(boot_now_ns);
        self.interning.clear_history();
        self.emit_fixed_interning_packet(boot_now_ns);
    }

    fn write_sample_packet(
        &mut self,
        sample: &ParsedSample,
        callstack_iid: Option<u64>,
        unwind_error: Option<UnwindError>,
        interned: InternedDataMarker,
    ) {
        self.writer.write(
            SequenceFlags::NEEDS_INCREMENTAL_STATE,
            sample.timestamp,
            None,
            PacketPayload::Sample {
                sample: PerfSamplePacket {
                    cpu: sample.cpu,
                    pid: sample.pid,
                    tid: sample.tid,
                    cpu_mode: crate::sample::to_cpu_mode(sample.cpu_mode),
                    timebase_count: sample.timebase_count,
                    callstack_iid,
                    unwind_error,
                },
                interned,
            },
        );
    }

    /// Counter mode (no callstack sampling): emitted straight off the read
    /// tick, no unwind queue involvement.
    fn emit_counter_sample(&mut self, sample: &ParsedSample) {
        self.write_sample_packet(sample, None, None, InternedDataMarker::default());
    }

    /// `emit_sample`: called once the unwinder reports a completed sample
    /// for this session. Interns the callstack in the shared trie and
    /// writes `interned_data` iff this session hasn't already emitted that
    /// id on its own sequence (spec.md §4.8/§4.9, §9 "per-session interning
    /// trackers").
    pub fn emit_sample(&mut self, trie: &mut CallstackTrie, sample: &ParsedSample, completed: &CompletedSample) {
        let (id, _is_new_globally) = trie.intern(&completed.frames, &completed.build_ids);
        let first_on_this_sequence = self.interning.note_emitted(id);
        let interned = InternedDataMarker {
            new_callstack_id: if first_on_this_sequence { Some(id) } else { None },
        };
        let unwind_error = if completed.unwind_error == UnwindError::None {
            None
        } else {
            Some(completed.unwind_error)
        };
        self.write_sample_packet(sample, Some(id), unwind_error, interned);
    }

    pub fn emit_skipped_sample(&mut self, sample: &ParsedSample, reason: SampleSkipReason) {
        self.writer.write(
            SequenceFlags::NEEDS_INCREMENTAL_STATE,
            sample.timestamp,
            None,
            PacketPayload::SkippedSample(SkippedSamplePacket {
                cpu: sample.cpu,
                pid: sample.pid,
                tid: sample.tid,
                cpu_mode: crate::sample::to_cpu_mode(sample.cpu_mode),
                timebase_count: sample.timebase_count,
                reason,
            }),
        );
    }

    pub fn emit_ring_buffer_loss(&mut self, cpu: u32, kernel_records_lost: u64, boot_now_ns: u64) {
        self.writer.write(
            SequenceFlags::empty(),
            boot_now_ns,
            Some(clock::BuiltinClock::Boottime),
            PacketPayload::RingBufferLoss(RingBufferLossPacket {
                cpu,
                kernel_records_lost,
            }),
        );
    }

    /// spec.md §4.7 abrupt purge: a final packet, then flush.
    pub fn emit_guardrail_stop_and_flush(&mut self, boot_now_ns: u64) {
        self.writer.write(
            SequenceFlags::empty(),
            boot_now_ns,
            Some(clock::BuiltinClock::Boottime),
            PacketPayload::ProducerStop(ProducerStopReason::Guardrail),
        );
        self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClockId, PerfAttr, RawServiceConfig, TargetFilter};
    use crate::packets::{PacketPayload, RecordingSink};
    use crate::sample::Frame;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct StubReader {
        cpu: u32,
        samples: Vec<ParsedSample>,
        enabled: bool,
    }

    impl EventReader for StubReader {
        fn read_until_sample(&mut self, _lost_cb: &mut dyn FnMut(u64)) -> Option<ParsedSample> {
            self.samples.pop()
        }
        fn enable(&mut self) {
            self.enabled = true;
        }
        fn disable(&mut self) {
            self.enabled = false;
        }
        fn cpu(&self) -> u32 {
            self.cpu
        }
    }

    fn sample(pid: pid_t) -> ParsedSample {
        ParsedSample {
            cpu: 0,
            pid,
            tid: pid,
            timestamp: 42,
            cpu_mode: 2,
            timebase_count: 1,
            regs: Some(crate::sample::RegisterSnapshot(vec![0; 4])),
            stack: vec![0u8; 16],
        }
    }

    fn config(filter: TargetFilter) -> SessionConfig {
        SessionConfig {
            perf_attr: PerfAttr {
                clockid: ClockId::Boottime,
                freq: false,
                sample_freq: 0,
                sample_period: 1_000_000,
            },
            timebase: Timebase::Counter(0),
            timebase_name: None,
            filter,
            read_tick_period_ms: 100,
            samples_per_tick_limit: 10,
            max_enqueued_footprint_bytes: 0,
            kernel_frames: false,
            unwind_state_clear_period_ms: 0,
            remote_descriptor_timeout_ms: 100,
            sample_callstacks: true,
            max_daemon_memory_kb: 0,
            target_installed_by: HashSet::new(),
            raw_ds_config: RawServiceConfig::default(),
        }
    }

    struct NoopUnwind {
        queue: crate::unwind::UnwindQueue,
    }
    impl UnwindWorker for NoopUnwind {
        fn queue(&self) -> &crate::unwind::UnwindQueue {
            &self.queue
        }
        fn post_start_data_source(&self, _session_id: SessionId, _kernel_frames: bool) {}
        fn post_process_queue(&self) {}
        fn post_initiate_data_source_stop(&self, _session_id: SessionId) {}
        fn post_purge_data_source(&self, _session_id: SessionId) {}
        fn post_record_timed_out_proc_descriptors(&self, _session_id: SessionId, _pid: pid_t) {}
        fn post_adopt_proc_descriptors(
            &self,
            _session_id: SessionId,
            _pid: pid_t,
            _maps_fd: std::os::unix::io::RawFd,
            _mem_fd: std::os::unix::io::RawFd,
        ) {
        }
        fn post_clear_cached_state_periodic(&self, _session_id: SessionId, _period_ms: u32) {}
    }

    fn sink_and_session(filter: TargetFilter) -> (Rc<RefCell<RecordingSink>>, SessionState) {
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        struct Forwarding(Rc<RefCell<RecordingSink>>);
        impl crate::packets::PacketSink for Forwarding {
            fn write_packet(&mut self, packet: crate::packets::TracePacket) {
                self.0.borrow_mut().packets.push(packet);
            }
            fn flush(&mut self) {
                self.0.borrow_mut().flush_count += 1;
            }
        }
        let writer = TraceWriter::new(Box::new(Forwarding(sink.clone())));
        let reader: Box<dyn EventReader> = Box::new(StubReader {
            cpu: 0,
            samples: vec![],
            enabled: false,
        });
        let session = SessionState::new(SessionId(1), config(filter), vec![reader], writer);
        (sink, session)
    }

    #[test]
    fn rejected_pid_never_resolves() {
        let mut filter = TargetFilter::default();
        filter.exclude_pids.insert(42);
        let (_sink, mut session) = sink_and_session(filter);
        let mut resolved = Vec::new();
        let decision = session.note_pid(42, &mut |_| None, &mut |p| resolved.push(p));
        assert!(matches!(decision, PidDecision::Drop));
        assert_eq!(session.process_status(42), Some(ProcessTrackingStatus::Rejected));
        assert!(resolved.is_empty());
    }

    #[test]
    fn open_filter_marks_resolving_and_notifies_once() {
        let (_sink, mut session) = sink_and_session(TargetFilter::default());
        let mut resolved = Vec::new();
        session.note_pid(7, &mut |_| None, &mut |p| resolved.push(p));
        session.note_pid(7, &mut |_| None, &mut |p| resolved.push(p));
        assert_eq!(resolved, vec![7]);
        assert_eq!(session.process_status(7), Some(ProcessTrackingStatus::Resolving));
    }

    #[test]
    fn expire_then_adopt_rescues_future_samples() {
        let (_sink, mut session) = sink_and_session(TargetFilter::default());
        session.note_pid(7, &mut |_| None, &mut |_| {});
        assert!(session.expire_if_resolving(7));
        assert_eq!(session.process_status(7), Some(ProcessTrackingStatus::Expired));
        assert!(session.try_adopt_descriptors(7));
        assert_eq!(session.process_status(7), Some(ProcessTrackingStatus::Resolved));
    }

    #[test]
    fn counter_mode_emits_without_interning() {
        let (sink, mut session) = sink_and_session(TargetFilter::default());
        session.config.sample_callstacks = false;
        session.emit_counter_sample(&sample(7));
        let packets = &sink.borrow().packets;
        assert_eq!(packets.len(), 1);
        match &packets[0].payload {
            PacketPayload::Sample { sample, interned } => {
                assert_eq!(sample.callstack_iid, None);
                assert_eq!(interned.new_callstack_id, None);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn emit_sample_reports_interned_data_only_on_first_sighting() {
        let (sink, mut session) = sink_and_session(TargetFilter::default());
        let mut trie = CallstackTrie::new();
        let completed = CompletedSample {
            cpu: 0,
            pid: 7,
            tid: 7,
            timestamp: 1,
            cpu_mode: 2,
            timebase_count: 1,
            frames: vec![Frame {
                rel_pc: 123,
                build_id_idx: 0,
            }],
            build_ids: vec!["abc".into()],
            unwind_error: UnwindError::None,
        };
        session.emit_sample(&mut trie, &sample(7), &completed);
        session.emit_sample(&mut trie, &sample(7), &completed);
        let packets = &sink.borrow().packets;
        assert_eq!(packets.len(), 2);
        let interned_flags: Vec<bool> = packets
            .iter()
            .map(|p| match &p.payload {
                PacketPayload::Sample { interned, .. } => interned.new_callstack_id.is_some(),
                _ => false,
            })
            .collect();
        assert_eq!(interned_flags, vec![true, false]);
    }

    #[test]
    fn drain_reader_emits_skip_for_expired_pid() {
        let (sink, mut session) = sink_and_session(TargetFilter::default());
        session.process_states.insert(9, ProcessTrackingStatus::Expired);
        session.readers[0] = Box::new(StubReader {
            cpu: 0,
            samples: vec![sample(9)],
            enabled: true,
        });
        let unwind = NoopUnwind {
            queue: crate::unwind::UnwindQueue::with_capacity(4),
        };
        let more = session.drain_reader(0, &unwind, &mut |_| None, &mut |_| {}, 0);
        assert!(!more);
        let packets = &sink.borrow().packets;
        assert_eq!(packets.len(), 1);
        match &packets[0].payload {
            PacketPayload::SkippedSample(s) => assert_eq!(s.reason, SampleSkipReason::ReadStage),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn drain_reader_emits_ring_buffer_loss_before_sample() {
        let (sink, mut session) = sink_and_session(TargetFilter::default());
        struct LossyReader {
            delivered: bool,
        }
        impl EventReader for LossyReader {
            fn read_until_sample(&mut self, lost_cb: &mut dyn FnMut(u64)) -> Option<ParsedSample> {
                if !self.delivered {
                    self.delivered = true;
                    lost_cb(3);
                    Some(sample(7))
                } else {
                    None
                }
            }
            fn enable(&mut self) {}
            fn disable(&mut self) {}
            fn cpu(&self) -> u32 {
                1
            }
        }
        session.readers[0] = Box::new(LossyReader { delivered: false });
        let unwind = NoopUnwind {
            queue: crate::unwind::UnwindQueue::with_capacity(4),
        };
        session.drain_reader(0, &unwind, &mut |_| None, &mut |_| {}, 0);
        let packets = &sink.borrow().packets;
        assert!(matches!(packets[0].payload, PacketPayload::RingBufferLoss(_)));
    }
}
