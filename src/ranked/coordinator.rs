//! The Ranked Coordinator: wires the queue, the accept coordinator, the
//! repository, and the session manager into one matchmaking pipeline, and
//! fans out ticket/match updates to the ranked WebSocket's subscribers.
//!
//! No teacher analogue; shaped like [`crate::manager::SessionManager`] — an
//! `Arc`-wrapped collaborator with a `spawn_tick`-style background loop —
//! generalized to several independent periodic sweeps instead of one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use derive_more::{Display, Error};

use sqlx::SqlitePool;

use tokio::sync::{Mutex, mpsc};

use turnkeep_model::ranked::{
    MatchInfo, MatchState, PlayerRating, QueueTicket, RankedMessage, TicketState,
};
use turnkeep_model::session::{
    ClientId, GameDifficulty, GameMode, GameType, MapSize, PersistentId, SessionConfig,
    WinnerDescriptor,
};

use crate::config::{MatchmakingConfig, MmrConfig};
use crate::manager::SessionManager;
use crate::ranked::accept::{AcceptCoordinator, AcceptOutcome, DissolvedMatch};
use crate::ranked::queue::MatchmakingQueue;
use crate::ranked::rating::{self, Opponent};
use crate::ranked::repository;
use crate::shard;

/// A match whose session has been created and is awaiting completion.
struct ActiveGame {
    info: MatchInfo,
    ticket_ids: Vec<String>,
}

struct Subscriber {
    player_id: Option<PersistentId>,
    ticket_id: Option<String>,
    tx: mpsc::UnboundedSender<RankedMessage>,
}

/// A ranked match never carries more humans than this; the remaining seats
/// are filled with bots.
const RANKED_LOBBY_SIZE: u32 = 4;
/// A ticket sitting in `matched`/`awaiting_accept` longer than this is
/// force-cancelled by the housekeeping broom.
const STALE_TICKET_AGE: TimeDelta = TimeDelta::hours(1);
/// An active game whose session outlives this without finishing is
/// defensively finalized by the housekeeping broom.
const MAX_SESSION_DURATION: TimeDelta = TimeDelta::hours(2);

#[derive(Debug, Display, Error)]
pub enum EnqueueError {
    #[display("{_0}")]
    Database(sqlx::Error),
    /// The player dodged a recent match and is still inside the escalating
    /// penalty window recorded by [`repository::record_dodge`].
    #[display("dodge penalty active until {until}")]
    Penalized { until: DateTime<Utc> },
}

impl From<sqlx::Error> for EnqueueError {
    fn from(error: sqlx::Error) -> EnqueueError {
        EnqueueError::Database(error)
    }
}

pub struct RankedCoordinator {
    db: SqlitePool,
    sessions: Arc<SessionManager>,
    matchmaking: MatchmakingConfig,
    mmr: MmrConfig,
    worker_id: u32,
    num_workers: u32,

    queue: Mutex<MatchmakingQueue>,
    accept: AcceptCoordinator,
    active_games: Mutex<Vec<ActiveGame>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl RankedCoordinator {
    pub fn new(
        db: SqlitePool,
        sessions: Arc<SessionManager>,
        matchmaking: MatchmakingConfig,
        mmr: MmrConfig,
        worker_id: u32,
        num_workers: u32,
    ) -> RankedCoordinator {
        RankedCoordinator {
            db,
            sessions,
            matchmaking,
            mmr,
            worker_id,
            num_workers,
            queue: Mutex::new(MatchmakingQueue::new()),
            accept: AcceptCoordinator::new(),
            active_games: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Rehydrates the in-memory queue from the repository. Called once at
    /// worker startup.
    pub async fn restore(&self) -> Result<(), sqlx::Error> {
        let tickets = repository::load_queued_tickets(&self.db).await?;
        self.queue.lock().await.restore_tickets(tickets);
        Ok(())
    }

    /// Spawns the recalculation, accept-timeout, and housekeeping loops.
    /// Call once, at worker startup.
    pub fn spawn_tick(self: &Arc<Self>) {
        let recalc = Arc::clone(self);
        let recalc_interval = self
            .matchmaking
            .recalculate_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recalc_interval);
            loop {
                ticker.tick().await;
                recalc.recalculate().await;
            }
        });

        let accept_sweep = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                accept_sweep.sweep_accept_timeouts().await;
            }
        });

        let stale_broom = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                stale_broom.sweep_stale_tickets().await;
            }
        });

        let game_broom = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                game_broom.sweep_orphan_games().await;
            }
        });

        let poller = Arc::clone(self);
        let poll_interval = self
            .matchmaking
            .poll_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(5));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                poller.broadcast_queue_positions().await;
            }
        });
    }

    /// Recomputes every queued ticket's position and pushes a fresh
    /// [`RankedMessage::QueueUpdate`] to its subscriber.
    async fn broadcast_queue_positions(&self) {
        let snapshot = self.queue.lock().await.queued_with_positions();
        for (ticket, position) in snapshot {
            let message = RankedMessage::QueueUpdate {
                position,
                estimated_wait_seconds: crate::ranked::poller::estimate_wait(
                    position,
                    self.matchmaking.recalculate_interval,
                ),
            };
            self.publish(&ticket, Some(message)).await;
        }
    }

    /// Enqueues `persistent_id` for ranked play in `season_id`.
    ///
    /// Rejected with [`EnqueueError::Penalized`] while the player's
    /// dodge-penalty window (set by [`repository::record_dodge`] the last
    /// time they abandoned an accepted match) hasn't yet elapsed.
    pub async fn enqueue(
        self: &Arc<Self>,
        persistent_id: PersistentId,
        season_id: String,
    ) -> Result<QueueTicket, EnqueueError> {
        if let Some(record) = repository::get_dodge_record(&self.db, &persistent_id).await? {
            if let Some(until) = record.penalty_until {
                if until > Utc::now() {
                    return Err(EnqueueError::Penalized { until });
                }
            }
        }

        let rating =
            repository::get_or_init_rating(&self.db, &persistent_id, &season_id, &self.mmr.defaults)
                .await?;

        let ticket_id = format!("ticket-{}", uuid::Uuid::new_v4());
        let ticket = self.queue.lock().await.join(
            ticket_id,
            persistent_id,
            season_id,
            rating.rating,
            Utc::now(),
        );

        repository::save_ticket(&self.db, &ticket).await?;
        self.publish(&ticket, None).await;
        self.recalculate().await;

        Ok(ticket)
    }

    pub async fn cancel(&self, ticket_id: &str) -> Result<bool, sqlx::Error> {
        let left = self.queue.lock().await.leave(ticket_id);
        if left {
            repository::delete_ticket(&self.db, ticket_id).await?;
        }
        Ok(left)
    }

    pub async fn ticket(&self, ticket_id: &str) -> Option<QueueTicket> {
        self.queue.lock().await.get(ticket_id)
    }

    pub async fn accept(
        self: &Arc<Self>,
        match_id: &str,
        ticket_id: &str,
        token: &str,
    ) -> Result<(), sqlx::Error> {
        match self.accept.accept(match_id, ticket_id, token).await {
            AcceptOutcome::AllAccepted(tickets) => self.on_all_accepted(match_id, tickets).await,
            AcceptOutcome::Recorded | AcceptOutcome::InvalidToken | AcceptOutcome::NotFound => {
                Ok(())
            }
        }
    }

    pub async fn decline(self: &Arc<Self>, match_id: &str, ticket_id: &str) -> Result<(), sqlx::Error> {
        if let Some(dissolved) = self.accept.decline(match_id, ticket_id).await {
            self.on_declined(dissolved).await?;
        }
        Ok(())
    }

    /// Subscribes a ranked-stream connection to updates for a player and/or
    /// a specific ticket. Returns a receiver the caller's serve loop reads
    /// pushes from.
    pub async fn subscribe(
        &self,
        player_id: Option<PersistentId>,
        ticket_id: Option<String>,
    ) -> mpsc::UnboundedReceiver<RankedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(Subscriber { player_id, ticket_id, tx });
        rx
    }

    /// Runs the selection algorithm and wires every freshly matched pair
    /// into the accept coordinator.
    async fn recalculate(self: &Arc<Self>) {
        let pairs = self.queue.lock().await.recalculate(Utc::now());
        for (a, b) in pairs {
            if let Err(error) = self.on_match_ready(vec![a, b]).await {
                tracing::error!(%error, "failed to finalize matched pair");
            }
        }
    }

    async fn on_match_ready(self: &Arc<Self>, tickets: Vec<QueueTicket>) -> Result<(), sqlx::Error> {
        let match_id = tickets
            .first()
            .and_then(|t| t.match_id.clone())
            .unwrap_or_else(|| format!("match-{}", uuid::Uuid::new_v4()));
        let now = Utc::now();
        let deadline = now + self.matchmaking.accept_window;

        let info = MatchInfo {
            id: match_id.clone(),
            season_id: tickets[0].season_id.clone(),
            participants: tickets.iter().map(|t| t.persistent_id.clone()).collect(),
            state: MatchState::AwaitingAccept,
            created_at: now,
            accept_deadline: deadline,
            session_id: None,
        };

        repository::save_match(&self.db, &info).await?;
        for ticket in &tickets {
            repository::save_ticket(&self.db, ticket).await?;
        }

        let tokens = self.accept.register(match_id, tickets.clone(), deadline).await;

        for ticket in &tickets {
            if let Some(token) = tokens.get(&ticket.id) {
                self.publish(
                    ticket,
                    Some(RankedMessage::MatchFound {
                        info: info.clone(),
                        accept_token: token.clone(),
                    }),
                )
                .await;
            }
        }

        Ok(())
    }

    async fn on_all_accepted(
        self: &Arc<Self>,
        match_id: &str,
        tickets: Vec<QueueTicket>,
    ) -> Result<(), sqlx::Error> {
        let session_id = self.fresh_owned_session_id();
        let participants: Vec<PersistentId> =
            tickets.iter().map(|t| t.persistent_id.clone()).collect();
        let season_id = tickets[0].season_id.clone();

        let config = SessionConfig {
            map: "ranked_standard".into(),
            map_size: MapSize::Small,
            difficulty: GameDifficulty::Medium,
            mode: GameMode::FreeForAll,
            game_type: GameType::Private,
            bot_count: RANKED_LOBBY_SIZE.saturating_sub(participants.len() as u32),
            max_players: Some(participants.len() as u32),
            disabled_units: Default::default(),
            team_assignments: Default::default(),
            toggles: Default::default(),
            prestart_seconds: None,
            spawn_immunity_seconds: None,
            allow_list: None,
            required_roles: None,
        };

        let creator = participants[0].clone();
        let session = self
            .sessions
            .create(session_id.clone(), config, creator)
            .await;
        session.request_start().await;

        let mut ready_tickets = Vec::with_capacity(tickets.len());
        for mut ticket in tickets {
            ticket.state = TicketState::Ready;
            repository::save_ticket(&self.db, &ticket).await?;
            ready_tickets.push(ticket);
        }

        let info = MatchInfo {
            id: match_id.to_string(),
            season_id,
            participants,
            state: MatchState::Ready,
            created_at: Utc::now(),
            accept_deadline: Utc::now(),
            session_id: Some(session_id.clone()),
        };
        repository::save_match(&self.db, &info).await?;
        repository::save_participants(&self.db, match_id, &info.participants).await?;

        for ticket in &ready_tickets {
            self.publish(
                ticket,
                Some(RankedMessage::MatchReady {
                    info: info.clone(),
                    session_id: session_id.clone(),
                }),
            )
            .await;
        }

        self.active_games.lock().await.push(ActiveGame {
            info,
            ticket_ids: ready_tickets.iter().map(|t| t.id.clone()).collect(),
        });

        let coordinator = Arc::clone(self);
        let watched_session = session_id.clone();
        tokio::spawn(async move {
            session.wait_until_finished().await;
            if let Err(error) = coordinator.on_session_finished(&watched_session).await {
                tracing::error!(%error, session_id = %watched_session, "failed to finalize ranked session");
            }
        });

        Ok(())
    }

    async fn on_declined(self: &Arc<Self>, dissolved: DissolvedMatch) -> Result<(), sqlx::Error> {
        let mut requeue = Vec::new();

        for ticket in dissolved.tickets {
            let accepted = dissolved.accepted_ticket_ids.contains(&ticket.id);
            let is_decliner = dissolved.declining_ticket_id.as_deref() == Some(ticket.id.as_str());

            if accepted && !is_decliner {
                requeue.push(ticket);
            } else {
                repository::record_dodge(
                    &self.db,
                    &ticket.persistent_id,
                    &self.matchmaking.dodge_penalty_seconds,
                )
                .await?;

                let mut cancelled = ticket;
                cancelled.state = TicketState::Cancelled;
                cancelled.match_id = None;
                repository::delete_ticket(&self.db, &cancelled.id).await?;
                self.publish(&cancelled, None).await;
            }
        }

        if !requeue.is_empty() {
            let now = Utc::now();
            self.queue.lock().await.requeue_tickets(requeue.clone(), now);
            for ticket in &requeue {
                let mut refreshed = ticket.clone();
                refreshed.queued_at = now;
                refreshed.state = TicketState::Queued;
                refreshed.match_id = None;
                repository::save_ticket(&self.db, &refreshed).await?;
                self.publish(&refreshed, None).await;
            }
        }

        Ok(())
    }

    async fn sweep_accept_timeouts(self: &Arc<Self>) {
        let dissolved = self.accept.sweep_timeouts(Utc::now()).await;
        for match_entry in dissolved {
            if let Err(error) = self.on_declined(match_entry).await {
                tracing::error!(%error, "failed to process accept timeout");
            }
        }
    }

    async fn sweep_stale_tickets(&self) {
        let stale = self.queue.lock().await.take_stale(Utc::now(), STALE_TICKET_AGE);
        for ticket in stale {
            if let Err(error) = repository::delete_ticket(&self.db, &ticket.id).await {
                tracing::error!(%error, ticket_id = %ticket.id, "failed to delete stale ticket");
                continue;
            }
            self.publish(&ticket, None).await;
        }

        if let Err(error) = repository::prune_stale_dodges(&self.db).await {
            tracing::error!(%error, "failed to prune stale dodge ledger entries");
        }
    }

    async fn sweep_orphan_games(self: &Arc<Self>) {
        let now = Utc::now();
        let orphaned: Vec<String> = {
            let active_games = self.active_games.lock().await;
            let mut orphaned = Vec::new();
            for game in active_games.iter() {
                let Some(session_id) = game.info.session_id.clone() else {
                    continue;
                };
                let gone = self.sessions.lookup(&session_id).await.is_none();
                let overdue = now - game.info.created_at > MAX_SESSION_DURATION;
                if gone || overdue {
                    orphaned.push(session_id);
                }
            }
            orphaned
        };

        for session_id in orphaned {
            if let Err(error) = self.on_session_finished(&session_id).await {
                tracing::error!(%error, %session_id, "failed to defensively finalize orphaned game");
            }
        }
    }

    /// Reacts to a session reaching `Finished`: rates the match (if a
    /// winner was adopted) or leaves it unrated (if the session vanished or
    /// timed out without a result), then clears it out of `activeGames` and
    /// the persistent queue.
    async fn on_session_finished(self: &Arc<Self>, session_id: &str) -> Result<(), sqlx::Error> {
        let game = {
            let mut active_games = self.active_games.lock().await;
            let Some(index) = active_games
                .iter()
                .position(|g| g.info.session_id.as_deref() == Some(session_id))
            else {
                return Ok(());
            };
            active_games.remove(index)
        };

        let session = self.sessions.lookup(session_id).await;
        let winner = match &session {
            Some(session) => session.winner().await,
            None => None,
        };

        self.rate_match(&game.info, winner).await?;

        let mut info = game.info;
        info.state = MatchState::Completed;
        repository::save_match(&self.db, &info).await?;

        for ticket_id in &game.ticket_ids {
            repository::delete_ticket(&self.db, ticket_id).await?;
        }
        self.queue.lock().await.complete_match(&info.id);

        Ok(())
    }

    async fn rate_match(
        &self,
        info: &MatchInfo,
        winner: Option<WinnerDescriptor>,
    ) -> Result<(), sqlx::Error> {
        if !self.mmr.enabled {
            return Ok(());
        }

        let winners = self
            .winning_persistent_ids(info.session_id.as_deref(), winner)
            .await;

        let mut ratings = Vec::with_capacity(info.participants.len());
        for participant in &info.participants {
            let rating = repository::get_or_init_rating(
                &self.db,
                participant,
                &info.season_id,
                &self.mmr.defaults,
            )
            .await?;
            ratings.push(rating);
        }

        for (i, subject) in ratings.iter().enumerate() {
            if !repository::participant_needs_rating(&self.db, &info.id, &subject.persistent_id)
                .await?
            {
                continue;
            }

            let opponents: Vec<Opponent> = ratings
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, opponent)| Opponent {
                    rating: opponent.rating,
                    deviation: opponent.deviation,
                    volatility: opponent.volatility,
                    score: score_between(&winners, &subject.persistent_id, &opponent.persistent_id),
                })
                .collect();

            let outcome = rating::rate(&self.mmr, subject, &opponents, 1.0);

            let after = PlayerRating {
                persistent_id: subject.persistent_id.clone(),
                season_id: subject.season_id.clone(),
                rating: outcome.rating,
                deviation: outcome.deviation,
                volatility: outcome.volatility,
                updated_at: Utc::now(),
            };

            repository::save_rating_update(&self.db, &info.id, subject, &after).await?;
            repository::mark_participant_rated(&self.db, &info.id, &subject.persistent_id, after.rating)
                .await?;
        }

        Ok(())
    }

    async fn winning_persistent_ids(
        &self,
        session_id: Option<&str>,
        winner: Option<WinnerDescriptor>,
    ) -> HashSet<PersistentId> {
        let Some(winner) = winner else {
            return HashSet::new();
        };
        let Some(session_id) = session_id else {
            return HashSet::new();
        };
        let Some(session) = self.sessions.lookup(session_id).await else {
            return HashSet::new();
        };

        let client_ids: Vec<ClientId> = match winner {
            WinnerDescriptor::Player { id } => vec![id],
            WinnerDescriptor::Team { member_ids, .. } => member_ids,
        };

        let mut winners = HashSet::new();
        for client_id in client_ids {
            if let Some(persistent_id) = session.persistent_id_for(&client_id).await {
                winners.insert(persistent_id);
            }
        }
        winners
    }

    /// Generates a session id that hashes, under this fleet's shard
    /// function, to this worker.
    fn fresh_owned_session_id(&self) -> String {
        loop {
            let candidate = format!("ranked-{}", uuid::Uuid::new_v4());
            if shard::worker_for(&candidate, self.num_workers) == self.worker_id {
                return candidate;
            }
        }
    }

    async fn publish(&self, ticket: &QueueTicket, message: Option<RankedMessage>) {
        let message = message.unwrap_or_else(|| RankedMessage::QueueUpdate {
            position: 0,
            estimated_wait_seconds: 0,
        });

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|subscriber| {
            let matches_player = subscriber
                .player_id
                .as_ref()
                .is_some_and(|id| id == &ticket.persistent_id);
            let matches_ticket = subscriber
                .ticket_id
                .as_deref()
                .is_some_and(|id| id == ticket.id);

            if !matches_player && !matches_ticket {
                return true;
            }
            subscriber.tx.send(message.clone()).is_ok()
        });
    }
}

fn score_between(winners: &HashSet<PersistentId>, subject: &PersistentId, opponent: &PersistentId) -> f64 {
    if winners.is_empty() {
        0.5
    } else if winners.contains(subject) {
        1.0
    } else if winners.contains(opponent) {
        0.0
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sqlx::sqlite::SqlitePoolOptions;

    use crate::archive::InMemoryArchiveSink;

    async fn test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite connects");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations apply");
        pool
    }

    async fn test_coordinator(db: SqlitePool) -> Arc<RankedCoordinator> {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemoryArchiveSink::new()),
            std::time::Duration::from_secs(1),
        ));
        Arc::new(RankedCoordinator::new(
            db,
            sessions,
            MatchmakingConfig::default(),
            MmrConfig::default(),
            0,
            1,
        ))
    }

    async fn drain_one(rx: &mut mpsc::UnboundedReceiver<RankedMessage>) -> RankedMessage {
        rx.recv().await.expect("a message was published")
    }

    #[tokio::test]
    async fn enqueueing_two_players_pairs_them_and_notifies_both() {
        let db = test_db().await;
        let coordinator = test_coordinator(db).await;

        let alice = PersistentId("alice".into());
        let bob = PersistentId("bob".into());

        let mut alice_rx = coordinator.subscribe(Some(alice.clone()), None).await;
        let mut bob_rx = coordinator.subscribe(Some(bob.clone()), None).await;

        coordinator
            .enqueue(alice.clone(), "season-1".into())
            .await
            .expect("alice enqueues");
        assert!(matches!(drain_one(&mut alice_rx).await, RankedMessage::QueueUpdate { .. }));

        coordinator
            .enqueue(bob.clone(), "season-1".into())
            .await
            .expect("bob enqueues");
        assert!(matches!(drain_one(&mut bob_rx).await, RankedMessage::QueueUpdate { .. }));

        assert!(matches!(drain_one(&mut alice_rx).await, RankedMessage::MatchFound { .. }));
        assert!(matches!(drain_one(&mut bob_rx).await, RankedMessage::MatchFound { .. }));
    }

    #[tokio::test]
    async fn both_tickets_accepting_creates_a_session_and_sends_match_ready() {
        let db = test_db().await;
        let coordinator = test_coordinator(db).await;

        let alice = PersistentId("alice".into());
        let bob = PersistentId("bob".into());

        let mut alice_rx = coordinator.subscribe(Some(alice.clone()), None).await;
        let mut bob_rx = coordinator.subscribe(Some(bob.clone()), None).await;

        let alice_ticket = coordinator.enqueue(alice.clone(), "season-1".into()).await.unwrap();
        let bob_ticket = coordinator.enqueue(bob.clone(), "season-1".into()).await.unwrap();

        // QueueUpdate from each player's own enqueue, then a MatchFound each
        // once the second enqueue's recalculate pairs them.
        drain_one(&mut alice_rx).await;
        drain_one(&mut bob_rx).await;

        let RankedMessage::MatchFound { info, accept_token: alice_token } = drain_one(&mut alice_rx).await
        else {
            panic!("expected alice's MatchFound");
        };
        let RankedMessage::MatchFound { accept_token: bob_token, .. } = drain_one(&mut bob_rx).await else {
            panic!("expected bob's MatchFound");
        };

        coordinator
            .accept(&info.id, &alice_ticket.id, &alice_token)
            .await
            .expect("alice accepts");
        coordinator
            .accept(&info.id, &bob_ticket.id, &bob_token)
            .await
            .expect("bob accepts, completing the pair");

        let RankedMessage::MatchReady { session_id, .. } = drain_one(&mut alice_rx).await else {
            panic!("expected alice's MatchReady");
        };
        assert!(matches!(drain_one(&mut bob_rx).await, RankedMessage::MatchReady { .. }));
        assert!(coordinator.sessions.lookup(&session_id).await.is_some());
    }

    #[tokio::test]
    async fn accept_timeout_with_no_accepters_penalizes_both_sides_without_requeue() {
        let db = test_db().await;
        let coordinator = test_coordinator(db.clone()).await;

        let alice = PersistentId("alice".into());
        let bob = PersistentId("bob".into());

        coordinator.enqueue(alice.clone(), "season-1".into()).await.unwrap();
        coordinator.enqueue(bob.clone(), "season-1".into()).await.unwrap();

        let tickets = coordinator.queue.lock().await.queued_with_positions();
        assert!(tickets.is_empty(), "both tickets were paired off into the accept phase");

        let dissolved = coordinator.accept.sweep_timeouts(Utc::now() + TimeDelta::days(1)).await;
        assert_eq!(dissolved.len(), 1);

        coordinator.on_declined(dissolved.into_iter().next().unwrap()).await.unwrap();

        // Nobody had accepted before the timeout, so there's no blameless
        // party to requeue: both tickets are cancelled and penalized.
        let requeued = coordinator.queue.lock().await.queued_with_positions();
        assert!(requeued.is_empty());

        for participant in [&alice, &bob] {
            let record = repository::get_dodge_record(&db, participant)
                .await
                .unwrap()
                .expect("a dodge was recorded");
            assert_eq!(record.count, 1);
        }
    }

    #[tokio::test]
    async fn enqueue_is_rejected_while_a_dodge_penalty_is_active() {
        let db = test_db().await;
        let coordinator = test_coordinator(db.clone()).await;

        let dodger = PersistentId("dodger".into());
        repository::record_dodge(&db, &dodger, &[120, 300, 600]).await.unwrap();

        let error = coordinator
            .enqueue(dodger.clone(), "season-1".into())
            .await
            .expect_err("still inside the penalty window");
        assert!(matches!(error, EnqueueError::Penalized { .. }));

        assert!(coordinator.queue.lock().await.queued_with_positions().is_empty());
    }

    #[tokio::test]
    async fn enqueue_succeeds_once_the_penalty_window_has_elapsed() {
        let db = test_db().await;
        let coordinator = test_coordinator(db.clone()).await;

        let dodger = PersistentId("dodger".into());
        // A zero-second escalation entry expires immediately.
        repository::record_dodge(&db, &dodger, &[0]).await.unwrap();

        coordinator
            .enqueue(dodger.clone(), "season-1".into())
            .await
            .expect("penalty window already elapsed");
    }

    #[tokio::test]
    async fn declining_requeues_the_blameless_accepter_and_penalizes_the_decliner() {
        let db = test_db().await;
        let coordinator = test_coordinator(db.clone()).await;

        let alice = PersistentId("alice".into());
        let bob = PersistentId("bob".into());

        let mut alice_rx = coordinator.subscribe(Some(alice.clone()), None).await;

        let alice_ticket = coordinator.enqueue(alice.clone(), "season-1".into()).await.unwrap();
        let bob_ticket = coordinator.enqueue(bob.clone(), "season-1".into()).await.unwrap();

        drain_one(&mut alice_rx).await; // alice's own QueueUpdate
        let RankedMessage::MatchFound { info, accept_token: alice_token } = drain_one(&mut alice_rx).await
        else {
            panic!("expected alice's MatchFound");
        };

        coordinator
            .accept(&info.id, &alice_ticket.id, &alice_token)
            .await
            .expect("alice accepts");

        coordinator.decline(&info.id, &bob_ticket.id).await.unwrap();

        let requeued = coordinator.queue.lock().await.queued_with_positions();
        assert_eq!(requeued.len(), 1, "alice had already accepted and is requeued");
        assert_eq!(requeued[0].0.persistent_id, alice);

        let bob_record = repository::get_dodge_record(&db, &bob)
            .await
            .unwrap()
            .expect("bob's decline was recorded as a dodge");
        assert_eq!(bob_record.count, 1);
        assert!(repository::get_dodge_record(&db, &alice).await.unwrap().is_none());
    }
}
