//! The matchmaking queue: per-season ordered ticket buckets and the
//! MMR-window selection algorithm.
//!
//! No teacher analogue (the teacher never had a queue); the in-memory
//! map-plus-ordered-bucket shape follows [`crate::manager::SessionManager`]'s
//! `RwLock<HashMap<...>>` convention, generalized to per-bucket `VecDeque`
//! ordering since join order, not just existence, matters here.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};

use turnkeep_model::ranked::{QueueTicket, TicketState};
use turnkeep_model::session::PersistentId;

/// `(wait, MMR half-width)`; `None` means "match with anyone".
fn window_for(wait: TimeDelta) -> Option<f64> {
    let secs = wait.num_milliseconds() as f64 / 1000.0;

    if secs < 30.0 {
        Some(100.0)
    } else if secs < 180.0 {
        let steps = ((secs - 30.0) / 15.0).floor() + 1.0;
        Some((100.0 + 50.0 * steps).min(400.0))
    } else {
        None
    }
}

#[derive(Default)]
pub struct MatchmakingQueue {
    /// Every non-terminal ticket, keyed by ticket id. The source of truth;
    /// buckets below only order the `Queued` subset.
    tickets: HashMap<String, QueueTicket>,
    /// Per-season join-order buckets of currently `Queued` ticket ids.
    buckets: HashMap<String, VecDeque<String>>,
    /// The one active (non-terminal) ticket id a player currently holds.
    by_player: HashMap<PersistentId, String>,
}

impl MatchmakingQueue {
    pub fn new() -> MatchmakingQueue {
        MatchmakingQueue::default()
    }

    pub fn get(&self, ticket_id: &str) -> Option<QueueTicket> {
        self.tickets.get(ticket_id).cloned()
    }

    /// If the player already holds a ticket past `Queued` (matched or
    /// later), it is returned as-is. Otherwise any existing queued ticket
    /// is cancelled and a fresh one is inserted at the tail of its bucket.
    pub fn join(
        &mut self,
        new_ticket_id: String,
        persistent_id: PersistentId,
        season_id: String,
        rating_snapshot: f64,
        now: DateTime<Utc>,
    ) -> QueueTicket {
        if let Some(existing_id) = self.by_player.get(&persistent_id) {
            if let Some(existing) = self.tickets.get(existing_id) {
                if existing.state != TicketState::Queued {
                    return existing.clone();
                }
                let existing_id = existing_id.clone();
                self.cancel_queued(&existing_id);
            }
        }

        let ticket = QueueTicket {
            id: new_ticket_id.clone(),
            persistent_id: persistent_id.clone(),
            season_id: season_id.clone(),
            rating_snapshot,
            queued_at: now,
            state: TicketState::Queued,
            match_id: None,
        };

        self.tickets.insert(new_ticket_id.clone(), ticket.clone());
        self.buckets.entry(season_id).or_default().push_back(new_ticket_id.clone());
        self.by_player.insert(persistent_id, new_ticket_id);

        ticket
    }

    /// Removes a queued ticket from its bucket and marks it cancelled.
    /// Returns `false` if the ticket doesn't exist or wasn't queued.
    pub fn leave(&mut self, ticket_id: &str) -> bool {
        match self.tickets.get(ticket_id) {
            Some(ticket) if ticket.state == TicketState::Queued => {
                self.cancel_queued(ticket_id);
                true
            }
            _ => false,
        }
    }

    fn cancel_queued(&mut self, ticket_id: &str) {
        if let Some(ticket) = self.tickets.get_mut(ticket_id) {
            ticket.state = TicketState::Cancelled;
            if let Some(bucket) = self.buckets.get_mut(&ticket.season_id) {
                bucket.retain(|id| id != ticket_id);
            }
            self.by_player.remove(&ticket.persistent_id);
        }
    }

    /// Rehydrates queued tickets at startup, preserving join order.
    pub fn restore_tickets(&mut self, tickets: Vec<QueueTicket>) {
        for ticket in tickets {
            self.by_player.insert(ticket.persistent_id.clone(), ticket.id.clone());
            self.buckets.entry(ticket.season_id.clone()).or_default().push_back(ticket.id.clone());
            self.tickets.insert(ticket.id.clone(), ticket);
        }
    }

    /// Re-queues tickets after a declined/timed-out accept phase: wiped of
    /// match association, reset to `queued`, `queuedAt` refreshed, and
    /// re-inserted at the tail (declines cost queue priority).
    pub fn requeue_tickets(&mut self, mut tickets: Vec<QueueTicket>, now: DateTime<Utc>) {
        for ticket in &mut tickets {
            ticket.state = TicketState::Queued;
            ticket.match_id = None;
            ticket.queued_at = now;
        }
        self.restore_tickets(tickets);
    }

    /// Removes every ticket associated with a completed match, returning
    /// them in `completed` state.
    pub fn complete_match(&mut self, match_id: &str) -> Vec<QueueTicket> {
        let ids: Vec<String> = self
            .tickets
            .values()
            .filter(|t| t.match_id.as_deref() == Some(match_id))
            .map(|t| t.id.clone())
            .collect();

        let mut completed = Vec::new();
        for id in ids {
            if let Some(mut ticket) = self.tickets.remove(&id) {
                self.by_player.remove(&ticket.persistent_id);
                ticket.state = TicketState::Completed;
                completed.push(ticket);
            }
        }
        completed
    }

    /// Every still-`Queued` ticket paired with its 0-based join-order
    /// position within its season's bucket, for the poller's periodic
    /// position/ETA broadcast.
    pub fn queued_with_positions(&self) -> Vec<(QueueTicket, u32)> {
        self.buckets
            .values()
            .flat_map(|bucket| {
                bucket
                    .iter()
                    .enumerate()
                    .filter_map(|(position, id)| {
                        self.tickets.get(id).map(|ticket| (ticket.clone(), position as u32))
                    })
            })
            .collect()
    }

    /// Force-cancels tickets stuck in `matched`/`ready` for longer than
    /// `max_age` — a match whose accept coordinator entry was lost to a
    /// crash or a bug, rather than a clean decline/timeout, would otherwise
    /// pin its tickets forever.
    pub fn take_stale(&mut self, now: DateTime<Utc>, max_age: TimeDelta) -> Vec<QueueTicket> {
        let stale_ids: Vec<String> = self
            .tickets
            .values()
            .filter(|t| {
                matches!(t.state, TicketState::Matched | TicketState::Ready)
                    && now - t.queued_at > max_age
            })
            .map(|t| t.id.clone())
            .collect();

        let mut stale = Vec::new();
        for id in stale_ids {
            if let Some(mut ticket) = self.tickets.remove(&id) {
                self.by_player.remove(&ticket.persistent_id);
                if let Some(bucket) = self.buckets.get_mut(&ticket.season_id) {
                    bucket.retain(|bucket_id| *bucket_id != id);
                }
                ticket.state = TicketState::Cancelled;
                stale.push(ticket);
            }
        }
        stale
    }

    /// Runs the selection algorithm over every bucket, pulling as many
    /// pairs as each bucket currently supports. Matched tickets are
    /// transitioned to `Matched` in place (not removed — the caller still
    /// needs to read them back out by id) but are popped from their
    /// bucket's queued order.
    pub fn recalculate(&mut self, now: DateTime<Utc>) -> Vec<(QueueTicket, QueueTicket)> {
        let seasons: Vec<String> = self.buckets.keys().cloned().collect();
        let mut pairs = Vec::new();

        for season_id in seasons {
            while let Some(pair) = self.attempt_match(&season_id, now) {
                pairs.push(pair);
            }
        }

        pairs
    }

    fn attempt_match(&mut self, season_id: &str, now: DateTime<Utc>) -> Option<(QueueTicket, QueueTicket)> {
        let bucket = self.buckets.get(season_id)?;
        let oldest_id = bucket.front()?.clone();
        let oldest = self.tickets.get(&oldest_id)?.clone();

        let window = window_for(now - oldest.queued_at);

        let mut best: Option<(String, f64)> = None;
        for candidate_id in bucket.iter().skip(1) {
            let candidate = self.tickets.get(candidate_id)?;
            if candidate.persistent_id == oldest.persistent_id {
                continue;
            }
            let diff = (candidate.rating_snapshot - oldest.rating_snapshot).abs();
            let within_window = window.is_none_or(|w| diff <= w);
            if !within_window {
                continue;
            }
            if best.as_ref().is_none_or(|(_, best_diff)| diff < *best_diff) {
                best = Some((candidate_id.clone(), diff));
            }
        }

        let (chosen_id, _) = best?;

        let match_id = format!("match-{}", uuid::Uuid::new_v4());

        let bucket = self.buckets.get_mut(season_id)?;
        bucket.retain(|id| *id != oldest_id && *id != chosen_id);

        let oldest = self.tickets.get_mut(&oldest_id)?;
        oldest.state = TicketState::Matched;
        oldest.match_id = Some(match_id.clone());
        let oldest = oldest.clone();

        let chosen = self.tickets.get_mut(&chosen_id)?;
        chosen.state = TicketState::Matched;
        chosen.match_id = Some(match_id);
        let chosen = chosen.clone();

        Some((oldest, chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).expect("valid timestamp")
    }

    #[test]
    fn join_then_leave_empties_the_bucket() {
        let mut queue = MatchmakingQueue::new();
        let ticket = queue.join(
            "t1".into(),
            PersistentId("alice".into()),
            "season-1".into(),
            1500.0,
            epoch(),
        );
        assert_eq!(ticket.state, TicketState::Queued);
        assert!(queue.leave("t1"));
        assert_eq!(queue.get("t1").unwrap().state, TicketState::Cancelled);
        assert!(queue.queued_with_positions().is_empty());
    }

    #[test]
    fn rejoining_replaces_the_old_queued_ticket() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        let second = queue.join("t2".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());

        assert_eq!(second.id, "t2");
        assert_eq!(queue.get("t1").unwrap().state, TicketState::Cancelled);
        assert_eq!(queue.queued_with_positions().len(), 1);
    }

    #[test]
    fn rejoining_a_matched_ticket_returns_it_unchanged() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 1500.0, epoch());
        queue.recalculate(epoch());

        let again = queue.join("t3".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        assert_eq!(again.id, "t1");
        assert_eq!(again.state, TicketState::Matched);
    }

    #[test]
    fn recalculate_pairs_close_ratings_within_season() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 1510.0, epoch());

        let pairs = queue.recalculate(epoch());
        assert_eq!(pairs.len(), 1);
        let (a, b) = &pairs[0];
        assert_eq!(a.id, "t1");
        assert_eq!(b.id, "t2");
        assert_eq!(queue.get("t1").unwrap().state, TicketState::Matched);
        assert_eq!(queue.get("t1").unwrap().match_id, queue.get("t2").unwrap().match_id);
    }

    #[test]
    fn recalculate_never_pairs_across_seasons() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-2".into(), 1500.0, epoch());

        assert!(queue.recalculate(epoch()).is_empty());
    }

    #[test]
    fn recalculate_skips_opponents_outside_the_mmr_window_while_fresh() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 2000.0, epoch());

        assert!(queue.recalculate(epoch()).is_empty());
    }

    #[test]
    fn recalculate_widens_the_window_as_the_oldest_ticket_ages() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 1700.0, epoch());

        let later = epoch() + TimeDelta::seconds(200);
        let pairs = queue.recalculate(later);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn queued_with_positions_preserves_join_order() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 2000.0, epoch());
        queue.join("t3".into(), PersistentId("carol".into()), "season-1".into(), 2500.0, epoch());

        let positions = queue.queued_with_positions();
        let mut by_id: HashMap<String, u32> =
            positions.into_iter().map(|(t, pos)| (t.id, pos)).collect();
        assert_eq!(by_id.remove("t1"), Some(0));
        assert_eq!(by_id.remove("t2"), Some(1));
        assert_eq!(by_id.remove("t3"), Some(2));
    }

    #[test]
    fn take_stale_removes_only_matched_or_ready_tickets_past_max_age() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 1500.0, epoch());
        queue.recalculate(epoch());

        let fresh = queue.take_stale(epoch() + TimeDelta::minutes(1), TimeDelta::hours(1));
        assert!(fresh.is_empty());

        let stale = queue.take_stale(epoch() + TimeDelta::hours(2), TimeDelta::hours(1));
        assert_eq!(stale.len(), 2);
        assert!(stale.iter().all(|t| t.state == TicketState::Cancelled));
        assert!(queue.get("t1").is_none());
    }

    #[test]
    fn requeue_tickets_resets_state_and_preserves_order() {
        let mut queue = MatchmakingQueue::new();
        let t1 = queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        let mut matched = t1;
        matched.state = TicketState::Matched;
        matched.match_id = Some("match-1".into());

        let later = epoch() + TimeDelta::seconds(30);
        queue.requeue_tickets(vec![matched], later);

        let restored = queue.get("t1").expect("ticket restored");
        assert_eq!(restored.state, TicketState::Queued);
        assert_eq!(restored.match_id, None);
        assert_eq!(restored.queued_at, later);
        assert_eq!(queue.queued_with_positions().len(), 1);
    }

    #[test]
    fn complete_match_removes_every_participant_ticket() {
        let mut queue = MatchmakingQueue::new();
        queue.join("t1".into(), PersistentId("alice".into()), "season-1".into(), 1500.0, epoch());
        queue.join("t2".into(), PersistentId("bob".into()), "season-1".into(), 1500.0, epoch());
        queue.recalculate(epoch());
        let match_id = queue.get("t1").unwrap().match_id.unwrap();

        let completed = queue.complete_match(&match_id);
        assert_eq!(completed.len(), 2);
        assert!(completed.iter().all(|t| t.state == TicketState::Completed));
        assert!(queue.get("t1").is_none());
        assert!(queue.get("t2").is_none());
    }
}
