mod event_config;
mod target_filter;

pub use event_config::{
    ClockId, EventConfig, PerfAttr, RawPerfEventConfig, RawRawEvent, RawServiceConfig,
    RawTracepoint, Timebase,
};
pub use target_filter::TargetFilter;

/// spec.md §3 names the per-session immutable configuration
/// `SessionConfig`; it is exactly the fully-resolved [`EventConfig`], kept
/// as an alias so call sites can use either name.
pub type SessionConfig = EventConfig;
