//! Connection state machine to the tracing service, spec.md §4.1. The
//! actual socket/IPC transport is external (spec.md §1); this module
//! defines the state machine, the backoff schedule, the data-source
//! descriptors registered on connect, and the seam for the service
//! notifications a `linux.perf` data source owes on stop.

use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    NotConnected,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotStarted, NotConnected)
                | (NotConnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, NotConnected)
        )
    }
}

/// `connect_with_retries`' backoff: starts at 100 ms, doubles on every
/// failure, caps at 30 s (spec.md §4.1/§5/§8).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current_ms: u32,
}

impl Backoff {
    pub const INITIAL_MS: u32 = 100;
    pub const CAP_MS: u32 = 30_000;

    pub fn new() -> Backoff {
        Backoff {
            current_ms: Self::INITIAL_MS,
        }
    }

    pub fn reset(&mut self) {
        self.current_ms = Self::INITIAL_MS;
    }

    pub fn current_ms(&self) -> u32 {
        self.current_ms
    }

    /// Returns the delay to use for the reconnect attempt just scheduled,
    /// then doubles (capped) for next time.
    pub fn advance(&mut self) -> u32 {
        let delay = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(Self::CAP_MS);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

/// Data-source descriptor registered with the service on connect,
/// spec.md §4.1/§6.
#[derive(Debug, Clone, Copy)]
pub struct DataSourceDescriptor {
    pub name: &'static str,
    pub handles_incremental_state_clear: bool,
    pub will_notify_on_stop: bool,
}

pub const LINUX_PERF_DATA_SOURCE: DataSourceDescriptor = DataSourceDescriptor {
    name: "linux.perf",
    handles_incremental_state_clear: true,
    will_notify_on_stop: true,
};

pub const METATRACE_DATA_SOURCE: DataSourceDescriptor = DataSourceDescriptor {
    name: "org.perfetto.traced_perf.metatrace",
    handles_incremental_state_clear: false,
    will_notify_on_stop: false,
};

/// The (external) IPC channel back to the tracing service. `linux.perf`
/// registers `will_notify_on_stop = true`, so an orderly stop owes this
/// call; a purge does not (spec.md §4.7, §9 open question).
pub trait ServiceNotifier {
    fn notify_data_source_stopped(&self, session_id: SessionId);
}

/// The (external) socket/IPC transport `connect_with_retries` drives
/// (spec.md §1/§4.1). A single non-blocking connect attempt; the state
/// machine owns retry/backoff on top of it.
pub trait Transport {
    fn try_connect(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let mut delays = Vec::new();
        for _ in 0..12 {
            delays.push(backoff.advance());
        }
        assert_eq!(delays[0], 100);
        assert_eq!(delays[1], 200);
        assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*delays.last().unwrap(), Backoff::CAP_MS);
        // Per spec.md §8: after ~9 failures the backoff stays at the cap.
        assert!(delays[9..].iter().all(|&d| d == Backoff::CAP_MS));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new();
        backoff.advance();
        backoff.advance();
        backoff.reset();
        assert_eq!(backoff.current_ms(), Backoff::INITIAL_MS);
    }

    #[test]
    fn allowed_state_edges() {
        use ConnectionState::*;
        assert!(NotStarted.can_transition_to(NotConnected));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!NotStarted.can_transition_to(Connected));
    }
}
