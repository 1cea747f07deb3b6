use thiserror::Error;

/// Errors that can arise while turning a raw, transport-decoded
/// `PerfEventConfig` into a validated [`crate::config::EventConfig`].
///
/// None of these are fatal to the daemon: per spec.md §7, configuration
/// errors are logged and the session is simply not created. The tracing
/// service observes the failure via its own ack timeout.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PerfEventConfig could not be parsed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("PerfEventConfig rejected: {0}")]
    Rejected(&'static str),

    #[error("no accessible tracefs mount point found for tracepoint lookup")]
    TracefsUnavailable,

    #[error("tracepoint {group}:{name} could not be resolved to an id")]
    UnknownTracepoint { group: String, name: String },

    #[error("failed to configure perf events for cpu{cpu}")]
    PerCpuSetupFailed { cpu: u32 },
}

/// Top-level error type for operations that can fail outside of config
/// parsing (currently just a thin wrapper, kept so callers have a single
/// error type to match on; the producer itself never propagates an `Err`
/// out of its public entry points: failures are logged and the affected
/// session/data-source is dropped instead).
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session {0} not found")]
    UnknownSession(u64),
}
