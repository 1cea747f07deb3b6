//! Memory guardrail, spec.md §4.10: every 1000 ms while a session exists,
//! sample the daemon's RSS and purge the session if it's above the
//! configured ceiling.

pub const CHECK_PERIOD_MS: u32 = 1000;

/// Reads `/proc/self/statm`'s resident-page count and converts it to KB.
/// `None` on any I/O or parse failure (treated as "can't tell, don't
/// purge": a guardrail that can't read its own sensor should not trip).
pub fn current_rss_kb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE).ok()??;
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64 / 1024)
}

/// `ceiling_kb == 0` means the guardrail is disabled for this session.
pub fn exceeds_ceiling(ceiling_kb: u32) -> bool {
    if ceiling_kb == 0 {
        return false;
    }
    current_rss_kb().map_or(false, |rss| rss >= u64::from(ceiling_kb))
}
