use super::target_filter::TargetFilter;
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;

/// Mirrors the handful of `clockid_t` values perf_event_open accepts.
/// spec.md §6 maps these onto the trace's `BUILTIN_CLOCK_*` domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    Realtime,
    Monotonic,
    MonotonicRaw,
    Boottime,
    /// Anything else: the syscall would have already rejected it, this is
    /// just a total-function safety net (see SPEC_FULL.md §4).
    Other(i32),
}

impl ClockId {
    pub fn from_raw(raw: i32) -> ClockId {
        // Matches the libc clockid_t constants used by perf_event_open.
        const CLOCK_REALTIME: i32 = 0;
        const CLOCK_MONOTONIC: i32 = 1;
        const CLOCK_MONOTONIC_RAW: i32 = 4;
        const CLOCK_BOOTTIME: i32 = 7;
        match raw {
            CLOCK_REALTIME => ClockId::Realtime,
            CLOCK_MONOTONIC => ClockId::Monotonic,
            CLOCK_MONOTONIC_RAW => ClockId::MonotonicRaw,
            CLOCK_BOOTTIME => ClockId::Boottime,
            other => ClockId::Other(other),
        }
    }
}

/// One of the three ways a session's timebase event can be described,
/// spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timebase {
    Counter(u32),
    Tracepoint {
        group: String,
        name: String,
        filter: String,
        /// Resolved lazily through a tracefs handle on first use, per §4.2
        /// step 3; `None` until resolution succeeds.
        id: Option<u32>,
    },
    Raw {
        r#type: u32,
        config: u64,
        config1: u64,
        config2: u64,
    },
}

/// Frequency- or period-driven sampling, plus the clock domain samples are
/// timestamped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfAttr {
    pub clockid: ClockId,
    pub freq: bool,
    pub sample_freq: u64,
    pub sample_period: u64,
}

/// Opaque, transport-provided configuration the authorization check
/// consults (spec.md §3 "raw service config (for authorization)"). The
/// actual shape of this is owned by the (external) tracing service
/// protocol; we keep just what the descriptor-adoption authorization
/// check in [`crate::descriptor`] needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawServiceConfig {
    /// If non-empty, only these uids may be profiled by this session.
    pub allowed_uids: Vec<u32>,
    pub session_name: Option<String>,
}

/// Fully resolved, immutable-after-creation per-session configuration.
/// This is the `EventConfig` of spec.md §4.2 step 3.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub perf_attr: PerfAttr,
    pub timebase: Timebase,
    pub timebase_name: Option<String>,
    pub filter: TargetFilter,
    pub read_tick_period_ms: u32,
    pub samples_per_tick_limit: u64,
    pub max_enqueued_footprint_bytes: u64,
    pub kernel_frames: bool,
    pub unwind_state_clear_period_ms: u32,
    pub remote_descriptor_timeout_ms: u32,
    pub sample_callstacks: bool,
    pub max_daemon_memory_kb: u32,
    pub target_installed_by: HashSet<String>,
    pub raw_ds_config: RawServiceConfig,
}

/// Wire-shaped config handed to us by the (external) transport layer,
/// already decoded out of whatever the service's IPC protocol uses.
/// Optional fields default sensibly so a minimal config is still valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPerfEventConfig {
    pub clockid: Option<i32>,
    pub freq: Option<bool>,
    pub sample_freq: Option<u64>,
    pub sample_period: Option<u64>,
    pub timebase_counter: Option<u32>,
    pub timebase_tracepoint: Option<RawTracepoint>,
    pub timebase_raw: Option<RawRawEvent>,
    pub timebase_name: Option<String>,
    pub target_filter: TargetFilter,
    pub read_tick_period_ms: Option<u32>,
    pub samples_per_tick_limit: Option<u64>,
    pub max_enqueued_footprint_bytes: Option<u64>,
    pub kernel_frames: Option<bool>,
    pub unwind_state_clear_period_ms: Option<u32>,
    pub remote_descriptor_timeout_ms: Option<u32>,
    pub sample_callstacks: Option<bool>,
    pub max_daemon_memory_kb: Option<u32>,
    pub target_installed_by: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTracepoint {
    pub group: String,
    pub name: String,
    #[serde(default)]
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRawEvent {
    pub r#type: u32,
    pub config: u64,
    #[serde(default)]
    pub config1: u64,
    #[serde(default)]
    pub config2: u64,
}

const DEFAULT_READ_TICK_PERIOD_MS: u32 = 100;
const DEFAULT_SAMPLES_PER_TICK_LIMIT: u64 = 500;
const DEFAULT_REMOTE_DESCRIPTOR_TIMEOUT_MS: u32 = 100;

impl EventConfig {
    /// Parses and validates a [`RawPerfEventConfig`] into an [`EventConfig`].
    ///
    /// `tracepoint_id_lookup` mirrors the original's lazily-initialized
    /// tracefs handle: it is only invoked (and only then fallible) when the
    /// timebase is a tracepoint. See spec.md §4.2 step 3.
    pub fn create(
        raw: &RawPerfEventConfig,
        raw_ds_config: RawServiceConfig,
        mut tracepoint_id_lookup: impl FnMut(&str, &str) -> Option<u32>,
    ) -> Result<EventConfig, ConfigError> {
        let freq = raw.freq.unwrap_or(false);
        if freq && raw.sample_freq.unwrap_or(0) == 0 {
            return Err(ConfigError::Rejected("freq sampling requires sample_freq"));
        }
        if !freq && raw.sample_period.unwrap_or(0) == 0 {
            return Err(ConfigError::Rejected(
                "period sampling requires sample_period",
            ));
        }

        let perf_attr = PerfAttr {
            clockid: ClockId::from_raw(raw.clockid.unwrap_or(1) /* CLOCK_MONOTONIC */),
            freq,
            sample_freq: raw.sample_freq.unwrap_or(0),
            sample_period: raw.sample_period.unwrap_or(0),
        };

        let timebase_count = [
            raw.timebase_counter.is_some(),
            raw.timebase_tracepoint.is_some(),
            raw.timebase_raw.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if timebase_count != 1 {
            return Err(ConfigError::Rejected(
                "exactly one of counter/tracepoint/raw_event must be set",
            ));
        }

        let timebase = if let Some(counter) = raw.timebase_counter {
            Timebase::Counter(counter)
        } else if let Some(tp) = &raw.timebase_tracepoint {
            let id = tracepoint_id_lookup(&tp.group, &tp.name);
            if id.is_none() {
                log::warn!(
                    "tracepoint {}:{} could not be resolved (tracefs unavailable?)",
                    tp.group,
                    tp.name
                );
            }
            Timebase::Tracepoint {
                group: tp.group.clone(),
                name: tp.name.clone(),
                filter: tp.filter.clone(),
                id,
            }
        } else {
            let raw_event = raw.timebase_raw.as_ref().unwrap();
            Timebase::Raw {
                r#type: raw_event.r#type,
                config: raw_event.config,
                config1: raw_event.config1,
                config2: raw_event.config2,
            }
        };

        Ok(EventConfig {
            perf_attr,
            timebase,
            timebase_name: raw.timebase_name.clone(),
            filter: raw.target_filter.clone(),
            read_tick_period_ms: raw
                .read_tick_period_ms
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_READ_TICK_PERIOD_MS),
            samples_per_tick_limit: raw
                .samples_per_tick_limit
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_SAMPLES_PER_TICK_LIMIT),
            max_enqueued_footprint_bytes: raw.max_enqueued_footprint_bytes.unwrap_or(0),
            kernel_frames: raw.kernel_frames.unwrap_or(false),
            unwind_state_clear_period_ms: raw.unwind_state_clear_period_ms.unwrap_or(0),
            remote_descriptor_timeout_ms: raw
                .remote_descriptor_timeout_ms
                .unwrap_or(DEFAULT_REMOTE_DESCRIPTOR_TIMEOUT_MS),
            sample_callstacks: raw.sample_callstacks.unwrap_or(true),
            max_daemon_memory_kb: raw.max_daemon_memory_kb.unwrap_or(0),
            target_installed_by: raw.target_installed_by.iter().cloned().collect(),
            raw_ds_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawPerfEventConfig {
        RawPerfEventConfig {
            sample_period: Some(1_000_000),
            timebase_counter: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_timebase() {
        let mut raw = minimal_raw();
        raw.timebase_counter = None;
        let result = EventConfig::create(&raw, RawServiceConfig::default(), |_, _| None);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_ambiguous_timebase() {
        let mut raw = minimal_raw();
        raw.timebase_raw = Some(RawRawEvent {
            r#type: 1,
            config: 2,
            config1: 0,
            config2: 0,
        });
        let result = EventConfig::create(&raw, RawServiceConfig::default(), |_, _| None);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_minimal_counter_config() {
        let raw = minimal_raw();
        let cfg = EventConfig::create(&raw, RawServiceConfig::default(), |_, _| None).unwrap();
        assert_eq!(cfg.timebase, Timebase::Counter(0));
        assert_eq!(cfg.read_tick_period_ms, DEFAULT_READ_TICK_PERIOD_MS);
    }

    #[test]
    fn resolves_tracepoint_id_via_lookup() {
        let mut raw = minimal_raw();
        raw.timebase_counter = None;
        raw.timebase_tracepoint = Some(RawTracepoint {
            group: "sched".into(),
            name: "sched_switch".into(),
            filter: String::new(),
        });
        let cfg =
            EventConfig::create(&raw, RawServiceConfig::default(), |_, _| Some(42)).unwrap();
        match cfg.timebase {
            Timebase::Tracepoint { id: Some(42), .. } => {}
            other => panic!("unexpected timebase: {:?}", other),
        }
    }

    #[test]
    fn explicit_zero_descriptor_timeout_is_preserved() {
        let mut raw = minimal_raw();
        raw.remote_descriptor_timeout_ms = Some(0);
        let cfg = EventConfig::create(&raw, RawServiceConfig::default(), |_, _| None).unwrap();
        assert_eq!(cfg.remote_descriptor_timeout_ms, 0);
    }
}
