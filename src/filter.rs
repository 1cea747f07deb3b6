//! Target-filter evaluation, spec.md §4.5. `evaluate` is a pure function
//! over an already-resolved cmdline so it can be tested without touching
//! `/proc`; [`resolve_cmdline`] is the (real) `/proc/<pid>/cmdline` lookup
//! used by the session drain path.

use crate::config::TargetFilter;
use libc::pid_t;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Steps 1-9 of spec.md §4.5, given an already-resolved (normalized)
/// cmdline. `additional_cmdlines` is mutated in place when a new cmdline
/// is adopted into the runtime budget.
///
/// Returns `true` when the pid should be rejected.
pub fn evaluate(
    pid: pid_t,
    cmdline: Option<&str>,
    additional_cmdlines: &mut HashSet<String>,
    filter: &TargetFilter,
) -> bool {
    if let Some(cmdline) = cmdline {
        if filter.exclude_cmdlines.contains(cmdline) {
            log::debug!("rejecting pid [{}] due to excluded cmdline", pid);
            return true;
        }
    }
    if filter.exclude_pids.contains(&pid) {
        log::debug!("rejecting pid [{}] due to excluded pid", pid);
        return true;
    }

    if let Some(cmdline) = cmdline {
        if filter.cmdlines.contains(cmdline) {
            return false;
        }
    }
    if filter.pids.contains(&pid) {
        return false;
    }
    if filter.is_open() {
        return false;
    }

    // We couldn't read the cmdline at all: a good predictor that we won't
    // be able to profile it either. Reject rather than silently burning
    // the additional-cmdline budget on an unknown entry.
    if let Some(cmdline) = cmdline {
        if additional_cmdlines.contains(cmdline) {
            return false;
        }
        if additional_cmdlines.len() < filter.additional_cmdline_count {
            additional_cmdlines.insert(cmdline.to_owned());
            return false;
        }
    }

    log::debug!("rejecting pid [{}]: no matching filter rule", pid);
    true
}

/// Reads and normalizes `/proc/<pid>/cmdline`: NUL-delimited argv[0],
/// basename of the path, with any `/proc/<pid>/exe` symlink left
/// unresolved (we only need an executable name, not its full path).
///
/// Returns `None` on any I/O error (pid already gone, permission denied,
/// etc), a transient lookup failure per spec.md §7, treated as "unknown
/// cmdline" by the filter.
pub fn resolve_cmdline(pid: pid_t) -> Option<String> {
    let path = format!("/proc/{}/cmdline", pid);
    let raw = fs::read(&path)
        .map_err(|e| log::debug!("failed to read {}: {}", path, e))
        .ok()?;
    let argv0 = raw.split(|&b| b == 0).next()?;
    if argv0.is_empty() {
        return None;
    }
    let argv0 = String::from_utf8_lossy(argv0);
    let basename = Path::new(argv0.as_ref())
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.into_owned());
    Some(basename)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(pids: &[pid_t], cmdlines: &[&str], additional: usize) -> TargetFilter {
        TargetFilter {
            pids: pids.iter().copied().collect(),
            cmdlines: cmdlines.iter().map(|s| s.to_string()).collect(),
            exclude_pids: HashSet::new(),
            exclude_cmdlines: HashSet::new(),
            additional_cmdline_count: additional,
        }
    }

    #[test]
    fn open_filter_accepts_everything() {
        let filter = filter_with(&[], &[], 0);
        let mut additional = HashSet::new();
        assert!(!evaluate(1234, None, &mut additional, &filter));
        assert!(!evaluate(1234, Some("anything"), &mut additional, &filter));
    }

    #[test]
    fn exclude_by_pid_wins_over_open_policy() {
        let mut filter = filter_with(&[], &[], 0);
        filter.exclude_pids.insert(42);
        let mut additional = HashSet::new();
        assert!(evaluate(42, Some("victim"), &mut additional, &filter));
        assert!(!evaluate(7, Some("other"), &mut additional, &filter));
    }

    #[test]
    fn additional_budget_accepts_first_k_distinct_cmdlines() {
        let filter = filter_with(&[], &[], 2);
        let mut additional = HashSet::new();
        assert!(!evaluate(1, Some("a"), &mut additional, &filter));
        assert!(!evaluate(2, Some("b"), &mut additional, &filter));
        // Third distinct cmdline exceeds the budget of 2.
        assert!(evaluate(3, Some("c"), &mut additional, &filter));
        // Already-adopted cmdlines keep being accepted.
        assert!(!evaluate(4, Some("a"), &mut additional, &filter));
    }

    #[test]
    fn unknown_cmdline_with_budget_is_rejected() {
        let filter = filter_with(&[], &[], 1);
        let mut additional = HashSet::new();
        assert!(evaluate(1, None, &mut additional, &filter));
    }

    #[test]
    fn exclude_cmdline_beats_explicit_pid_inclusion() {
        let mut filter = filter_with(&[42], &[], 0);
        filter.exclude_cmdlines.insert("victim".to_string());
        let mut additional = HashSet::new();
        assert!(evaluate(42, Some("victim"), &mut additional, &filter));
    }
}
