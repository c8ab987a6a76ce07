//! The Accept Coordinator: tracks the accept/decline window for each
//! proposed match.
//!
//! No teacher analogue; shaped like [`crate::ranked::queue::MatchmakingQueue`]
//! as a plain `Mutex`-guarded map, since every operation here already needs
//! to see the whole match's accept state at once (there's no per-bucket
//! parallelism to preserve the way the queue has).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use tokio::sync::Mutex;

use turnkeep_model::ranked::QueueTicket;

struct PendingMatch {
    tickets: Vec<QueueTicket>,
    tokens: HashMap<String, String>,
    accepted: HashSet<String>,
    deadline: DateTime<Utc>,
}

pub enum AcceptOutcome {
    /// Recorded; other tickets still outstanding.
    Recorded,
    /// Every ticket accepted; the match is ready. The match is removed from
    /// the registry.
    AllAccepted(Vec<QueueTicket>),
    InvalidToken,
    NotFound,
}

/// The outcome of a decline or a timeout sweep: the match is dissolved.
/// Tickets that had already accepted are blameless and get requeued;
/// everyone else (the explicit decliner, or every non-accepter on a
/// timeout) owes a dodge penalty.
pub struct DissolvedMatch {
    pub tickets: Vec<QueueTicket>,
    pub accepted_ticket_ids: HashSet<String>,
    /// The ticket that explicitly declined, if this wasn't a timeout.
    pub declining_ticket_id: Option<String>,
}

#[derive(Default)]
pub struct AcceptCoordinator {
    matches: Mutex<HashMap<String, PendingMatch>>,
}

impl AcceptCoordinator {
    pub fn new() -> AcceptCoordinator {
        AcceptCoordinator::default()
    }

    /// Registers a freshly matched pair, minting one accept token per
    /// ticket. Returns the tokens, keyed by ticket id, for the caller to
    /// hand back to each player.
    pub async fn register(
        &self,
        match_id: String,
        tickets: Vec<QueueTicket>,
        deadline: DateTime<Utc>,
    ) -> HashMap<String, String> {
        let tokens: HashMap<String, String> = tickets
            .iter()
            .map(|ticket| (ticket.id.clone(), uuid::Uuid::new_v4().to_string()))
            .collect();

        self.matches.lock().await.insert(
            match_id,
            PendingMatch {
                tickets,
                tokens: tokens.clone(),
                accepted: HashSet::new(),
                deadline,
            },
        );

        tokens
    }

    pub async fn accept(&self, match_id: &str, ticket_id: &str, token: &str) -> AcceptOutcome {
        let mut matches = self.matches.lock().await;
        let Some(pending) = matches.get_mut(match_id) else {
            return AcceptOutcome::NotFound;
        };

        match pending.tokens.get(ticket_id) {
            Some(expected) if expected == token => {
                pending.accepted.insert(ticket_id.to_string());
            }
            _ => return AcceptOutcome::InvalidToken,
        }

        if pending.accepted.len() == pending.tickets.len() {
            let pending = matches.remove(match_id).expect("just matched above");
            return AcceptOutcome::AllAccepted(pending.tickets);
        }

        AcceptOutcome::Recorded
    }

    pub async fn decline(&self, match_id: &str, ticket_id: &str) -> Option<DissolvedMatch> {
        let pending = self.matches.lock().await.remove(match_id)?;
        Some(DissolvedMatch {
            tickets: pending.tickets,
            accepted_ticket_ids: pending.accepted,
            declining_ticket_id: Some(ticket_id.to_string()),
        })
    }

    /// Dissolves every match whose accept deadline has passed, returning
    /// one [`DissolvedMatch`] per timed-out match.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<DissolvedMatch> {
        let mut matches = self.matches.lock().await;
        let expired_ids: Vec<String> = matches
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|id| matches.remove(&id))
            .map(|pending| DissolvedMatch {
                tickets: pending.tickets,
                accepted_ticket_ids: pending.accepted,
                declining_ticket_id: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeDelta;

    use turnkeep_model::session::PersistentId;

    fn ticket(id: &str) -> QueueTicket {
        QueueTicket {
            id: id.to_string(),
            persistent_id: PersistentId(format!("player-{id}")),
            season_id: "season-1".into(),
            rating_snapshot: 1500.0,
            queued_at: Utc::now(),
            state: turnkeep_model::ranked::TicketState::Matched,
            match_id: Some("match-1".into()),
        }
    }

    #[tokio::test]
    async fn accept_outcome_progresses_to_all_accepted() {
        let coordinator = AcceptCoordinator::new();
        let tickets = vec![ticket("t1"), ticket("t2")];
        let deadline = Utc::now() + TimeDelta::seconds(20);
        let tokens = coordinator.register("match-1".into(), tickets, deadline).await;

        let outcome = coordinator
            .accept("match-1", "t1", tokens.get("t1").unwrap())
            .await;
        assert!(matches!(outcome, AcceptOutcome::Recorded));

        let outcome = coordinator
            .accept("match-1", "t2", tokens.get("t2").unwrap())
            .await;
        match outcome {
            AcceptOutcome::AllAccepted(tickets) => assert_eq!(tickets.len(), 2),
            _ => panic!("expected AllAccepted"),
        }
    }

    #[tokio::test]
    async fn accept_with_wrong_token_is_rejected() {
        let coordinator = AcceptCoordinator::new();
        let deadline = Utc::now() + TimeDelta::seconds(20);
        coordinator.register("match-1".into(), vec![ticket("t1")], deadline).await;

        let outcome = coordinator.accept("match-1", "t1", "not-the-token").await;
        assert!(matches!(outcome, AcceptOutcome::InvalidToken));
    }

    #[tokio::test]
    async fn accept_on_unknown_match_is_not_found() {
        let coordinator = AcceptCoordinator::new();
        let outcome = coordinator.accept("nonexistent", "t1", "whatever").await;
        assert!(matches!(outcome, AcceptOutcome::NotFound));
    }

    #[tokio::test]
    async fn decline_dissolves_and_reports_the_decliner() {
        let coordinator = AcceptCoordinator::new();
        let tickets = vec![ticket("t1"), ticket("t2")];
        let deadline = Utc::now() + TimeDelta::seconds(20);
        let tokens = coordinator.register("match-1".into(), tickets, deadline).await;
        coordinator.accept("match-1", "t1", tokens.get("t1").unwrap()).await;

        let dissolved = coordinator.decline("match-1", "t2").await.expect("match was pending");
        assert_eq!(dissolved.declining_ticket_id.as_deref(), Some("t2"));
        assert!(dissolved.accepted_ticket_ids.contains("t1"));
        assert_eq!(dissolved.tickets.len(), 2);

        assert!(coordinator.decline("match-1", "t2").await.is_none());
    }

    #[tokio::test]
    async fn sweep_timeouts_only_dissolves_expired_matches() {
        let coordinator = AcceptCoordinator::new();
        let now = Utc::now();
        coordinator
            .register("expired".into(), vec![ticket("t1")], now - TimeDelta::seconds(1))
            .await;
        coordinator
            .register("fresh".into(), vec![ticket("t2")], now + TimeDelta::seconds(60))
            .await;

        let dissolved = coordinator.sweep_timeouts(now).await;
        assert_eq!(dissolved.len(), 1);
        assert_eq!(dissolved[0].tickets[0].id, "t1");
        assert!(dissolved[0].declining_ticket_id.is_none());

        assert!(coordinator.sweep_timeouts(now).await.is_empty());
    }
}
