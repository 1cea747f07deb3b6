use libc::pid_t;
use serde::Deserialize;
use std::collections::HashSet;

/// Process-identity filter for a session, §3 `TargetFilter`.
///
/// A sample is accepted iff `((included sets empty AND
/// additional_cmdline_count == 0) OR pid/cmdline matches inclusion OR
/// cmdline fits into the additional-budget) AND no exclusion matches`. The
/// actual decision function lives in [`crate::filter`]; this type only
/// holds the (immutable, post session-creation) configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetFilter {
    pub pids: HashSet<pid_t>,
    pub cmdlines: HashSet<String>,
    pub exclude_pids: HashSet<pid_t>,
    pub exclude_cmdlines: HashSet<String>,
    /// Budget for "adopt up to N new cmdlines seen at runtime".
    pub additional_cmdline_count: usize,
}

impl TargetFilter {
    /// True when no inclusion rule is configured at all, i.e. the open
    /// policy from spec.md §4.5 step 6 applies.
    pub fn is_open(&self) -> bool {
        self.pids.is_empty() && self.cmdlines.is_empty() && self.additional_cmdline_count == 0
    }
}
