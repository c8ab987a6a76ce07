//! Boyer-Moore majority-vote tallying, used both for per-turn hash
//! reconciliation (desync detection) and for winner-vote resolution.
//!
//! No direct teacher analogue; the careful invariant bookkeeping here
//! (`HashSet`/`HashMap` tracking of who has voted for what) follows the
//! style of the teacher's own sent-tracking idioms in `room/mod.rs`.

use std::collections::HashMap;
use std::hash::Hash;

use turnkeep_model::session::ClientId;

/// Accumulates one vote per client for some comparable key (a turn hash, a
/// winner-descriptor key) and can resolve a strict majority via the
/// Boyer-Moore majority-vote algorithm.
#[derive(Debug, Default)]
pub struct MajorityTracker<K> {
    votes: HashMap<ClientId, K>,
}

impl<K> MajorityTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> MajorityTracker<K> {
        MajorityTracker {
            votes: HashMap::new(),
        }
    }

    /// Records (or overwrites) one client's vote.
    pub fn record(&mut self, client_id: ClientId, key: K) {
        self.votes.insert(client_id, key);
    }

    pub fn remove(&mut self, client_id: &ClientId) {
        self.votes.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Finds the Boyer-Moore majority candidate among recorded votes and
    /// returns it along with every client that voted for it, or `None` if
    /// no vote has been recorded at all.
    ///
    /// The candidate is returned whether or not it actually clears a
    /// majority of `total_voters` — a caller that needs to know how
    /// confident the pick is should compare `holders.len()` against
    /// `total_voters` itself (the session's reconciliation tie-break does
    /// exactly this to decide whether to treat every client as out of
    /// sync).
    pub fn resolve(&self, total_voters: usize) -> Option<(K, Vec<ClientId>)> {
        if total_voters == 0 {
            return None;
        }

        let mut candidate: Option<&K> = None;
        let mut count: usize = 0;
        for key in self.votes.values() {
            if count == 0 {
                candidate = Some(key);
                count = 1;
            } else if Some(key) == candidate {
                count += 1;
            } else {
                count -= 1;
            }
        }

        let candidate = candidate?.clone();

        let holders: Vec<ClientId> = self
            .votes
            .iter()
            .filter(|(_, key)| **key == candidate)
            .map(|(id, _)| id.clone())
            .collect();

        Some((candidate, holders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ClientId {
        ClientId(format!("client-{n}"))
    }

    #[test]
    fn resolves_clear_majority() {
        let mut tracker = MajorityTracker::new();
        tracker.record(id(1), "a");
        tracker.record(id(2), "a");
        tracker.record(id(3), "a");
        tracker.record(id(4), "b");

        let (key, holders) = tracker.resolve(4).expect("majority");
        assert_eq!(key, "a");
        assert_eq!(holders.len(), 3);
    }

    #[test]
    fn candidate_returned_even_without_enough_reports() {
        let mut tracker = MajorityTracker::new();
        tracker.record(id(1), "a");
        tracker.record(id(2), "b");

        let (key, holders) = tracker.resolve(5).expect("candidate");
        assert_eq!(key, "b");
        assert_eq!(holders.len(), 1);
    }

    #[test]
    fn plurality_candidate_returned_without_a_true_majority() {
        let mut tracker = MajorityTracker::new();
        tracker.record(id(1), "a");
        tracker.record(id(2), "a");
        tracker.record(id(3), "b");
        tracker.record(id(4), "c");

        let (key, holders) = tracker.resolve(4).expect("candidate");
        assert_eq!(key, "a");
        assert_eq!(holders.len(), 2);
    }

    #[test]
    fn no_candidate_without_any_votes() {
        let tracker: MajorityTracker<&str> = MajorityTracker::new();
        assert!(tracker.resolve(4).is_none());
    }
}
