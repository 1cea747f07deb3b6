//! The top-level producer, spec.md §2/§4: ties together the connection
//! state machine, the per-session map (insertion order preserved, for
//! first-fit descriptor routing per spec.md §9), the shared callstack
//! trie, and the cooperative task runner. All of this lives behind
//! `Rc<RefCell<_>>` so deferred closures can hold a weak reference that
//! simply no-ops once the producer has been torn down (spec.md §5/§9).
//!
//! Cross-thread messages from the (external, separate-thread) unwind
//! worker arrive over a channel and are drained every time [`Producer::pump`]
//! runs; there is no locking of session state outside that single
//! consumer.

use crate::clock;
use crate::config::{EventConfig, RawPerfEventConfig, RawServiceConfig};
use crate::connection::{self, ConnectionState, ServiceNotifier, Transport};
use crate::descriptor::{self, DescriptorGetter, InstallerAuthority, STARTUP_DELAY_MS};
use crate::error::ConfigError;
use crate::guardrail;
use crate::interning::CallstackTrie;
use crate::metatrace::MetatraceWriter;
use crate::packets::{PacketSinkFactory, TraceWriter};
use crate::reader::{EventReader, ReaderFactory};
use crate::sample::{CompletedSample, ParsedSample, SampleSkipReason};
use crate::session::{SessionId, SessionState, SessionStatus};
use crate::task_runner::{self, TaskRunner};
use crate::unwind::UnwindWorker;
use libc::{pid_t, uid_t};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Messages the (external, separate-thread) unwind worker posts back into
/// the producer's single-threaded task runner, spec.md §5.
pub enum WorkerMessage {
    EmitSample {
        session_id: SessionId,
        sample: ParsedSample,
        completed: CompletedSample,
    },
    /// `PostEmitUnwinderSkippedSample`: the unwinder discarded or failed to
    /// resolve a queued sample (e.g. a descriptor-timeout discard, spec.md
    /// §7) and wants a skipped-sample packet emitted on its behalf, almost
    /// always with `SampleSkipReason::UnwindStage`.
    EmitSkippedSample {
        session_id: SessionId,
        sample: ParsedSample,
        reason: SampleSkipReason,
    },
    FinishDataSourceStop {
        session_id: SessionId,
    },
}

struct ProducerInner {
    connection_state: ConnectionState,
    backoff: connection::Backoff,
    transport: Box<dyn Transport>,
    service_notifier: Box<dyn ServiceNotifier>,
    sessions: Vec<SessionState>,
    trie: CallstackTrie,
    metatrace: Option<MetatraceWriter>,
    task_runner: TaskRunner,
    descriptor_getter: Box<dyn DescriptorGetter>,
    installer_authority: Box<dyn InstallerAuthority>,
    unwind: Box<dyn UnwindWorker>,
    reader_factory: Box<dyn ReaderFactory>,
    sink_factory: Box<dyn PacketSinkFactory>,
    tracepoint_lookup: Box<dyn Fn(&str, &str) -> Option<u32>>,
    worker_rx: crossbeam_channel::Receiver<WorkerMessage>,
}

/// A cheaply-cloneable handle onto the producer's state. Every clone
/// shares the same `Rc<RefCell<_>>` and the same `generation` counter;
/// deferred tasks instead capture [`WeakHandle`]s (see [`Producer::weak`])
/// so a torn-down producer's in-flight closures become no-ops rather than
/// panicking on a dangling strong reference, or worse, firing against a
/// reconstructed producer they were never meant to see (spec.md §5/§9).
pub struct Producer {
    inner: Rc<RefCell<ProducerInner>>,
    /// Bumped by [`Producer::teardown_and_reconstruct`]. Stands in for the
    /// source's destroy/placement-new trick: since we reuse the same
    /// `Rc<RefCell<_>>` rather than replacing it, a plain `Weak::upgrade`
    /// would still succeed after teardown. Every [`WeakHandle`] instead
    /// captures the generation it was issued at and refuses to upgrade
    /// once this counter has moved on. Plain `Cell`, not `AtomicU64`: the
    /// whole producer is single-threaded (spec.md §5).
    generation: Rc<Cell<u64>>,
}

impl Clone for Producer {
    fn clone(&self) -> Self {
        Producer {
            inner: self.inner.clone(),
            generation: self.generation.clone(),
        }
    }
}

/// A cancellable reference to the producer, captured by every deferred
/// closure posted onto the [`TaskRunner`] (spec.md §9's "weak self-handle
/// ... captures ... an atomic generation counter incremented on
/// teardown"). `upgrade` returns `None` if the producer has been dropped
/// *or* torn down and reconstructed since this handle was issued.
#[derive(Clone)]
struct WeakHandle {
    inner: Weak<RefCell<ProducerInner>>,
    generation: Rc<Cell<u64>>,
    issued_at: u64,
}

impl WeakHandle {
    fn upgrade(&self) -> Option<Producer> {
        if self.generation.get() != self.issued_at {
            return None;
        }
        self.inner.upgrade().map(|inner| Producer {
            inner,
            generation: self.generation.clone(),
        })
    }
}

#[allow(clippy::too_many_arguments)]
impl Producer {
    pub fn new(
        transport: Box<dyn Transport>,
        service_notifier: Box<dyn ServiceNotifier>,
        descriptor_getter: Box<dyn DescriptorGetter>,
        installer_authority: Box<dyn InstallerAuthority>,
        unwind: Box<dyn UnwindWorker>,
        reader_factory: Box<dyn ReaderFactory>,
        sink_factory: Box<dyn PacketSinkFactory>,
        tracepoint_lookup: Box<dyn Fn(&str, &str) -> Option<u32>>,
    ) -> (Producer, crossbeam_channel::Sender<WorkerMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = ProducerInner {
            connection_state: ConnectionState::NotStarted,
            backoff: connection::Backoff::new(),
            transport,
            service_notifier,
            sessions: Vec::new(),
            trie: CallstackTrie::new(),
            metatrace: None,
            task_runner: TaskRunner::new(),
            descriptor_getter,
            installer_authority,
            unwind,
            reader_factory,
            sink_factory,
            tracepoint_lookup,
            worker_rx: rx,
        };
        (
            Producer {
                inner: Rc::new(RefCell::new(inner)),
                generation: Rc::new(Cell::new(0)),
            },
            tx,
        )
    }

    fn weak(&self) -> WeakHandle {
        WeakHandle {
            inner: Rc::downgrade(&self.inner),
            generation: self.generation.clone(),
            issued_at: self.generation.get(),
        }
    }

    // ---- connection state machine, spec.md §4.1 ----

    pub fn connect_with_retries(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.backoff.reset();
            inner.connection_state = ConnectionState::NotConnected;
        }
        self.attempt_connect();
    }

    fn attempt_connect(&self) {
        let connected = {
            let mut inner = self.inner.borrow_mut();
            inner.connection_state = ConnectionState::Connecting;
            inner.transport.try_connect()
        };
        if connected {
            let mut inner = self.inner.borrow_mut();
            inner.connection_state = ConnectionState::Connected;
            inner.backoff.reset();
            log::info!(
                "connected; registered data sources '{}' and '{}'",
                connection::LINUX_PERF_DATA_SOURCE.name,
                connection::METATRACE_DATA_SOURCE.name
            );
        } else {
            self.schedule_backoff_reconnect();
        }
    }

    pub fn on_disconnect(&self) {
        let state = self.inner.borrow().connection_state;
        match state {
            ConnectionState::Connected => self.teardown_and_reconstruct(),
            ConnectionState::Connecting => self.schedule_backoff_reconnect(),
            _ => {}
        }
    }

    /// spec.md §4.1: "tear the producer down and reconstruct in place (all
    /// sessions lost)". We don't need the source's literal destroy/placement
    /// new trick (spec.md §9): clearing the `Rc<RefCell<_>>`'s contents in
    /// place and bumping `generation` achieves the same observable effect
    /// for every outstanding [`WeakHandle`]; any closure posted before this
    /// call now refuses to upgrade even though the `Rc` itself lives on.
    fn teardown_and_reconstruct(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.sessions.clear();
            inner.trie.clear();
            inner.metatrace = None;
            inner.connection_state = ConnectionState::NotConnected;
        }
        self.generation.set(self.generation.get().wrapping_add(1));
        self.connect_with_retries();
    }

    fn schedule_backoff_reconnect(&self) {
        let weak = self.weak();
        let mut inner = self.inner.borrow_mut();
        inner.connection_state = ConnectionState::Disconnected;
        let delay_ms = inner.backoff.advance();
        inner
            .task_runner
            .post_delayed_task(u64::from(delay_ms), move || {
                if let Some(producer) = weak.upgrade() {
                    producer.attempt_connect();
                }
            });
    }

    // ---- data source start, spec.md §4.2 ----

    pub fn start_data_source(
        &self,
        session_id: SessionId,
        data_source_name: &str,
        target_buffer: u32,
        raw_config_json: &[u8],
        raw_ds_config: RawServiceConfig,
    ) {
        if data_source_name == connection::METATRACE_DATA_SOURCE.name {
            self.inner
                .borrow_mut()
                .metatrace
                .get_or_insert_with(MetatraceWriter::new)
                .start(target_buffer);
            return;
        }
        if data_source_name != connection::LINUX_PERF_DATA_SOURCE.name {
            log::warn!("unknown data source '{}'", data_source_name);
            return;
        }

        let raw: RawPerfEventConfig = match serde_json::from_slice(raw_config_json) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}", ConfigError::Malformed(e));
                return;
            }
        };

        let weak = self.weak();
        let mut inner_ref = self.inner.borrow_mut();
        let inner = &mut *inner_ref;

        let event_config = {
            let tracepoint_lookup = &inner.tracepoint_lookup;
            match EventConfig::create(&raw, raw_ds_config, |group, name| {
                tracepoint_lookup(group, name)
            }) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("rejecting linux.perf config: {}", e);
                    return;
                }
            }
        };

        let cpu_count = match nix::unistd::sysconf(nix::unistd::SysconfVar::_SC_NPROCESSORS_CONF) {
            Ok(Some(n)) if n > 0 => n,
            _ => {
                log::warn!("could not determine cpu count, discarding session");
                return;
            }
        };

        let mut readers: Vec<Box<dyn EventReader>> = Vec::with_capacity(cpu_count as usize);
        for cpu in 0..cpu_count as u32 {
            match inner.reader_factory.create_reader(cpu, &event_config) {
                Ok(reader) => readers.push(reader),
                Err(()) => {
                    log::warn!(
                        "failed to configure perf events for cpu{}, discarding session",
                        cpu
                    );
                    return;
                }
            }
        }

        let writer = TraceWriter::new(inner.sink_factory.create_sink(target_buffer));
        let mut session = SessionState::new(session_id, event_config, readers, writer);
        session.enable_all_readers();

        let boot_now_ns = clock::boot_time_ns();
        session.emit_defaults_packet(boot_now_ns);
        session.emit_fixed_interning_packet(boot_now_ns);

        let kernel_frames = session.config().kernel_frames;
        let clear_period_ms = session.config().unwind_state_clear_period_ms;
        let read_period_ms = session.config().read_tick_period_ms;
        let max_memory_kb = session.config().max_daemon_memory_kb;

        inner.sessions.push(session);
        inner.unwind.post_start_data_source(session_id, kernel_frames);
        if clear_period_ms > 0 {
            inner
                .unwind
                .post_clear_cached_state_periodic(session_id, clear_period_ms);
        }

        let offset_ms = task_runner::phase_offset_ms(session_id.0, read_period_ms);
        let wall_now_ms = clock::ns_to_ms(boot_now_ns);
        let first_delay_ms = task_runner::next_tick_delay_ms(read_period_ms, offset_ms, wall_now_ms);
        let weak_tick = weak.clone();
        inner
            .task_runner
            .post_delayed_task(u64::from(first_delay_ms), move || {
                if let Some(producer) = weak_tick.upgrade() {
                    producer.on_read_tick(session_id);
                }
            });

        if max_memory_kb > 0 {
            inner
                .task_runner
                .post_delayed_task(u64::from(guardrail::CHECK_PERIOD_MS), move || {
                    if let Some(producer) = weak.upgrade() {
                        producer.on_guardrail_check(session_id);
                    }
                });
        }
    }

    // ---- read tick / per-reader drain, spec.md §4.3/§4.4 ----

    fn on_read_tick(&self, session_id: SessionId) {
        let weak = self.weak();
        let mut inner_ref = self.inner.borrow_mut();
        let inner = &mut *inner_ref;

        let idx = match inner.sessions.iter().position(|s| s.id() == session_id) {
            Some(i) => i,
            None => return,
        };

        let boot_now_ns = clock::boot_time_ns();
        let reader_count = inner.sessions[idx].reader_count();
        let timeout_ms = inner.sessions[idx].config().remote_descriptor_timeout_ms;
        let mut more_available = false;

        {
            let descriptor_getter = inner.descriptor_getter.as_ref();
            let unwind = inner.unwind.as_ref();
            let task_runner = &mut inner.task_runner;
            let session = &mut inner.sessions[idx];

            for reader_idx in 0..reader_count {
                let weak_for_timeout = weak.clone();
                let more = session.drain_reader(
                    reader_idx,
                    unwind,
                    &mut crate::filter::resolve_cmdline,
                    &mut |pid| {
                        Producer::initiate_descriptor_lookup(
                            descriptor_getter,
                            task_runner,
                            weak_for_timeout.clone(),
                            session_id,
                            pid,
                            timeout_ms,
                        );
                    },
                    boot_now_ns,
                );
                more_available |= more;
            }
        }

        inner.unwind.post_process_queue();

        let shutting_down = inner.sessions[idx].status() == SessionStatus::ShuttingDown;
        if shutting_down && !more_available {
            inner.unwind.post_initiate_data_source_stop(session_id);
            return;
        }

        let period_ms = inner.sessions[idx].config().read_tick_period_ms;
        let offset_ms = task_runner::phase_offset_ms(session_id.0, period_ms);
        let wall_now_ms = clock::ns_to_ms(boot_now_ns);
        let delay_ms = task_runner::next_tick_delay_ms(period_ms, offset_ms, wall_now_ms);
        inner
            .task_runner
            .post_delayed_task(u64::from(delay_ms), move || {
                if let Some(producer) = weak.upgrade() {
                    producer.on_read_tick(session_id);
                }
            });
    }

    // ---- descriptor lookup, spec.md §4.6 ----

    fn initiate_descriptor_lookup(
        descriptor_getter: &dyn DescriptorGetter,
        task_runner: &mut TaskRunner,
        weak: WeakHandle,
        session_id: SessionId,
        pid: pid_t,
        timeout_ms: u32,
    ) {
        if descriptor_getter.requires_delayed_request() {
            let weak2 = weak;
            task_runner.post_delayed_task(u64::from(STARTUP_DELAY_MS), move || {
                if let Some(producer) = weak2.upgrade() {
                    producer.start_descriptor_lookup(session_id, pid, timeout_ms);
                }
            });
        } else {
            Producer::start_descriptor_lookup_now(
                descriptor_getter,
                task_runner,
                weak,
                session_id,
                pid,
                timeout_ms,
            );
        }
    }

    fn start_descriptor_lookup_now(
        descriptor_getter: &dyn DescriptorGetter,
        task_runner: &mut TaskRunner,
        weak: WeakHandle,
        session_id: SessionId,
        pid: pid_t,
        timeout_ms: u32,
    ) {
        descriptor_getter.request_descriptors_for_pid(pid);
        task_runner.post_delayed_task(u64::from(timeout_ms), move || {
            if let Some(producer) = weak.upgrade() {
                producer.evaluate_descriptor_lookup_timeout(session_id, pid);
            }
        });
    }

    fn start_descriptor_lookup(&self, session_id: SessionId, pid: pid_t, timeout_ms: u32) {
        let weak = self.weak();
        let mut inner_ref = self.inner.borrow_mut();
        let inner = &mut *inner_ref;
        let descriptor_getter = inner.descriptor_getter.as_ref();
        let task_runner = &mut inner.task_runner;
        Producer::start_descriptor_lookup_now(
            descriptor_getter,
            task_runner,
            weak,
            session_id,
            pid,
            timeout_ms,
        );
    }

    fn evaluate_descriptor_lookup_timeout(&self, session_id: SessionId, pid: pid_t) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id() == session_id) {
            if session.expire_if_resolving(pid) {
                inner
                    .unwind
                    .post_record_timed_out_proc_descriptors(session_id, pid);
            }
        }
    }

    /// `on_proc_descriptors`: first-fit across sessions in insertion order,
    /// spec.md §4.6/§9.
    pub fn on_proc_descriptors(&self, pid: pid_t, uid: uid_t, maps_fd: RawFd, mem_fd: RawFd) {
        let mut inner_ref = self.inner.borrow_mut();
        let inner = &mut *inner_ref;
        let installer_authority = inner.installer_authority.as_ref();

        let mut matched = None;
        for session in inner.sessions.iter_mut() {
            let authorized = descriptor::can_profile(
                &session.config().raw_ds_config,
                uid,
                &session.config().target_installed_by,
                installer_authority,
            );
            if authorized && session.try_adopt_descriptors(pid) {
                matched = Some(session.id());
                break;
            }
        }

        match matched {
            Some(session_id) => inner
                .unwind
                .post_adopt_proc_descriptors(session_id, pid, maps_fd, mem_fd),
            None => log::debug!("no authorized session claimed descriptors for pid {}", pid),
        }
    }

    // ---- stop / purge, spec.md §4.7 ----

    /// Service-initiated ordered stop: disables readers immediately;
    /// residual buffer contents are drained by subsequent ticks, which
    /// eventually trigger the unwinder's stop cascade (see `on_read_tick`).
    pub fn initiate_stop_data_source(&self, session_id: SessionId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id() == session_id) {
            session.begin_ordered_stop();
        }
    }

    /// `PostFinishDataSourceStop` callback from the unwind worker: flushes,
    /// erases the session, and notifies the service (since `linux.perf`
    /// registers `will_notify_on_stop = true`).
    fn finish_data_source_stop(&self, session_id: SessionId) {
        let mut inner = self.inner.borrow_mut();
        let idx = match inner.sessions.iter().position(|s| s.id() == session_id) {
            Some(i) => i,
            None => return,
        };
        inner.sessions[idx].flush();
        inner.sessions.remove(idx);
        inner.service_notifier.notify_data_source_stopped(session_id);
        if inner.sessions.is_empty() {
            inner.trie.clear();
        }
    }

    /// Abrupt purge (guardrail trip or internal fault): final packet,
    /// flush, erase immediately, tell the unwinder to purge. The service is
    /// *not* notified (spec.md §4.7, §9 open question).
    pub fn purge_session(&self, session_id: SessionId) {
        let mut inner = self.inner.borrow_mut();
        let idx = match inner.sessions.iter().position(|s| s.id() == session_id) {
            Some(i) => i,
            None => return,
        };
        let boot_now_ns = clock::boot_time_ns();
        inner.sessions[idx].emit_guardrail_stop_and_flush(boot_now_ns);
        inner.sessions.remove(idx);
        inner.unwind.post_purge_data_source(session_id);
        if inner.sessions.is_empty() {
            inner.trie.clear();
        }
    }

    // ---- memory guardrail, spec.md §4.10 ----

    fn on_guardrail_check(&self, session_id: SessionId) {
        let weak = self.weak();
        let exceeded = {
            let inner = self.inner.borrow();
            match inner.sessions.iter().find(|s| s.id() == session_id) {
                Some(session) => guardrail::exceeds_ceiling(session.config().max_daemon_memory_kb),
                None => return,
            }
        };
        if exceeded {
            self.purge_session(session_id);
            return;
        }
        let mut inner = self.inner.borrow_mut();
        inner
            .task_runner
            .post_delayed_task(u64::from(guardrail::CHECK_PERIOD_MS), move || {
                if let Some(producer) = weak.upgrade() {
                    producer.on_guardrail_check(session_id);
                }
            });
    }

    // ---- incremental state clear, spec.md §4.9 ----

    pub fn clear_incremental_state(&self, session_ids: &[SessionId]) {
        let mut inner_ref = self.inner.borrow_mut();
        let inner = &mut *inner_ref;
        let boot_now_ns = clock::boot_time_ns();
        let mut cleared_any = false;
        for session in inner.sessions.iter_mut() {
            if session_ids.contains(&session.id()) {
                session.clear_incremental_state(boot_now_ns);
                cleared_any = true;
            }
        }
        if cleared_any {
            inner.trie.clear();
        }
    }

    // ---- worker message pump, spec.md §5 ----

    fn handle_worker_message(&self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::EmitSample {
                session_id,
                sample,
                completed,
            } => {
                let mut inner_ref = self.inner.borrow_mut();
                let inner = &mut *inner_ref;
                if let Some(session) = inner.sessions.iter_mut().find(|s| s.id() == session_id) {
                    session.emit_sample(&mut inner.trie, &sample, &completed);
                }
            }
            WorkerMessage::EmitSkippedSample {
                session_id,
                sample,
                reason,
            } => {
                let mut inner = self.inner.borrow_mut();
                if let Some(session) = inner.sessions.iter_mut().find(|s| s.id() == session_id) {
                    session.emit_skipped_sample(&sample, reason);
                }
            }
            WorkerMessage::FinishDataSourceStop { session_id } => {
                self.finish_data_source_stop(session_id);
            }
        }
    }

    /// Drains due tasks and any pending worker messages. The caller is
    /// expected to call this from whatever real event loop owns the
    /// process (out of scope here, spec.md §1's "command-line entry
    /// point").
    pub fn pump(&self) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            inner.task_runner.take_ready(Instant::now())
        };
        for task in ready {
            task();
        }
        loop {
            let received = {
                let inner = self.inner.borrow();
                inner.worker_rx.try_recv()
            };
            match received {
                Ok(msg) => self.handle_worker_message(msg),
                Err(_) => break,
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.inner.borrow().task_runner.next_due()
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.inner.borrow().sessions.len()
    }
}
