//! The boundary with the (external) process-descriptor lookup subsystem:
//! how `/proc/<pid>/{maps,mem}` file descriptors actually get obtained
//! (typically via a privileged helper) is out of scope, spec.md §1. This
//! module defines that seam plus the authorization check performed once
//! descriptors come back.

use crate::config::RawServiceConfig;
use libc::{pid_t, uid_t};
use std::collections::HashSet;

/// Fixed delay before issuing a descriptor request on platforms where the
/// kernel/libc combination needs a grace period after `execve` before
/// signal handlers (or whatever mechanism the getter uses) are back in a
/// well-defined state. See spec.md §4.6 and the comment on the original's
/// `kProcDescriptorsAndroidDelayMs`.
pub const STARTUP_DELAY_MS: u32 = 50;

/// Async channel for requesting `(maps_fd, mem_fd)` for a pid. The actual
/// delivery happens out-of-band via a callback the producer registers
/// (modeled as `Producer::on_proc_descriptors`, since it needs to mutate
/// session state the getter has no business touching).
pub trait DescriptorGetter {
    /// Whether this platform needs [`STARTUP_DELAY_MS`] inserted before the
    /// actual request (currently true only on Android; always false on a
    /// stock Linux host).
    fn requires_delayed_request(&self) -> bool;

    /// Kicks off an async lookup; results arrive later via the registered
    /// callback, not as a return value here.
    fn request_descriptors_for_pid(&self, pid: pid_t);
}

/// Authorization oracle for whether a session may receive descriptors for
/// a given uid. The actual package-manager / installer-attribution lookup
/// this would consult on a real system is external; callers provide their
/// own policy (tests use a permissive stub).
pub trait InstallerAuthority {
    /// Returns the package/binary's installer identity for `uid`, if
    /// known.
    fn installed_by(&self, uid: uid_t) -> Option<String>;
}

/// A permissive default: every uid is authorized, regardless of
/// `target_installed_by`. Useful for configs that don't restrict by
/// installer at all.
pub struct AllowAll;

impl InstallerAuthority for AllowAll {
    fn installed_by(&self, _uid: uid_t) -> Option<String> {
        None
    }
}

/// spec.md §4.6: `on_proc_descriptors` hands descriptors to the first
/// session "authorized for this uid and `target_installed_by`".
pub fn can_profile(
    raw_ds_config: &RawServiceConfig,
    uid: uid_t,
    target_installed_by: &HashSet<String>,
    authority: &dyn InstallerAuthority,
) -> bool {
    if !raw_ds_config.allowed_uids.is_empty() && !raw_ds_config.allowed_uids.contains(&uid) {
        return false;
    }
    if target_installed_by.is_empty() {
        return true;
    }
    match authority.installed_by(uid) {
        Some(installer) => target_installed_by.contains(&installer),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInstaller(&'static str);
    impl InstallerAuthority for FixedInstaller {
        fn installed_by(&self, _uid: uid_t) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[test]
    fn no_restrictions_allows_everyone() {
        let cfg = RawServiceConfig::default();
        assert!(can_profile(&cfg, 10_000, &HashSet::new(), &AllowAll));
    }

    #[test]
    fn allowed_uids_gate_access() {
        let cfg = RawServiceConfig {
            allowed_uids: vec![1000],
            session_name: None,
        };
        assert!(can_profile(&cfg, 1000, &HashSet::new(), &AllowAll));
        assert!(!can_profile(&cfg, 2000, &HashSet::new(), &AllowAll));
    }

    #[test]
    fn target_installed_by_requires_matching_installer() {
        let cfg = RawServiceConfig::default();
        let mut installed_by = HashSet::new();
        installed_by.insert("com.android.vending".to_string());
        assert!(can_profile(
            &cfg,
            1000,
            &installed_by,
            &FixedInstaller("com.android.vending")
        ));
        assert!(!can_profile(
            &cfg,
            1000,
            &installed_by,
            &FixedInstaller("com.other.store")
        ));
        assert!(!can_profile(&cfg, 1000, &installed_by, &AllowAll));
    }
}
