//! Callstack interning, spec.md §3/§4.9. The [`CallstackTrie`] is shared
//! across all sessions (one monotonic id space); each session additionally
//! tracks which ids it has already emitted on its own packet sequence via
//! [`InterningTracker`], since incremental-state rules are per-sequence.

use crate::sample::Frame;
use std::collections::HashMap;
use std::collections::HashSet;

/// A callstack is keyed by its resolved frames plus the build-ids they
/// reference, so identical stacks across samples collapse to one id.
type CallstackKey = (Vec<u64>, Vec<String>);

/// Append-only (except for explicit clears) trie mapping callstacks to a
/// monotonically increasing interning id. Shared by reference across all
/// sessions in the producer.
///
/// Per spec.md §4.9 and §9: clearing drops the entries (so a post-clear
/// `intern()` of a previously-seen stack gets a *new* id) but never resets
/// the id counter, so ids minted before and after a clear never collide
/// within the same recording.
pub struct CallstackTrie {
    next_id: u64,
    ids: HashMap<CallstackKey, u64>,
}

impl Default for CallstackTrie {
    fn default() -> Self {
        CallstackTrie::new()
    }
}

impl CallstackTrie {
    pub fn new() -> CallstackTrie {
        CallstackTrie {
            next_id: 1,
            ids: HashMap::new(),
        }
    }

    /// Returns `(id, is_new)`. `is_new` tells the caller whether
    /// interning data for this id needs to be written into the packet's
    /// `interned_data` field.
    pub fn intern(&mut self, frames: &[Frame], build_ids: &[String]) -> (u64, bool) {
        let key = (
            frames.iter().map(|f| f.rel_pc).collect(),
            build_ids.to_vec(),
        );
        if let Some(&id) = self.ids.get(&key) {
            return (id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(key, id);
        (id, true)
    }

    /// spec.md §4.9: "clear the shared callstack trie". Entries are
    /// dropped; `next_id` keeps climbing.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Per-session record of which interning ids have already been written on
/// this session's packet sequence, so repeat occurrences of the same
/// callstack don't re-emit `interned_data`.
#[derive(Default)]
pub struct InterningTracker {
    emitted: HashSet<u64>,
}

impl InterningTracker {
    pub fn new() -> InterningTracker {
        InterningTracker::default()
    }

    /// Records that `id` is about to be (or already was) written for this
    /// session. Returns `true` if this is the first time *this session*
    /// has emitted it, i.e. whether the caller should populate
    /// `interned_data` for it, independent of whether the trie considered
    /// it new globally (a session can still owe its own incremental-state
    /// consumer a copy after `clear_history`).
    pub fn note_emitted(&mut self, id: u64) -> bool {
        self.emitted.insert(id)
    }

    /// spec.md §4.9: "clear the session's interning history" on an
    /// incremental-state clear, forgetting which ids were emitted on this
    /// sequence so far (the decoder has also forgotten, since the packet
    /// defaults were just reset).
    pub fn clear_history(&mut self) {
        self.emitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(pcs: &[u64]) -> Vec<Frame> {
        pcs.iter()
            .map(|&rel_pc| Frame {
                rel_pc,
                build_id_idx: 0,
            })
            .collect()
    }

    #[test]
    fn identical_stacks_collapse_to_one_id() {
        let mut trie = CallstackTrie::new();
        let (id_a, new_a) = trie.intern(&frames(&[1, 2, 3]), &["abc".into()]);
        let (id_b, new_b) = trie.intern(&frames(&[1, 2, 3]), &["abc".into()]);
        assert_eq!(id_a, id_b);
        assert!(new_a);
        assert!(!new_b);
    }

    #[test]
    fn clear_resets_novelty_but_ids_keep_growing() {
        let mut trie = CallstackTrie::new();
        let (first_id, _) = trie.intern(&frames(&[1]), &[]);
        trie.clear();
        let (second_id, is_new) = trie.intern(&frames(&[1]), &[]);
        assert!(is_new);
        assert!(second_id > first_id);
    }

    #[test]
    fn interning_tracker_only_reports_new_once() {
        let mut tracker = InterningTracker::new();
        assert!(tracker.note_emitted(5));
        assert!(!tracker.note_emitted(5));
        tracker.clear_history();
        assert!(tracker.note_emitted(5));
    }
}
