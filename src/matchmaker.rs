//! The fleet matchmaker check-in: periodically announces this worker's
//! identity and load to an external matchmaker and, on assignment, spins up
//! a public session for it.
//!
//! This is distinct from [`crate::ranked`], which pairs ranked tickets and
//! creates sessions itself without any external collaborator. Here the
//! worker is a passive capacity announcer; the matchmaker decides whether
//! and when to hand back an assignment.

use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};

use rand::Rng;

use serde::{Deserialize, Serialize};

use turnkeep_model::session::{
    GameDifficulty, GameMode, GameType, MapSize, PersistentId, SessionConfig,
};

use crate::config::MatchmakerConfig;
use crate::manager::SessionManager;
use crate::shard;

/// Announced to the external matchmaker on every check-in.
#[derive(Debug, Serialize)]
pub struct CheckIn {
    pub worker_id: u32,
    /// Current concurrent clients across every session this worker hosts.
    pub ccu: u32,
    /// A session id generated so it already hashes to this worker, offered
    /// as a candidate for the matchmaker to assign back.
    pub candidate_session_id: String,
}

/// What the matchmaker hands back when it assigns this worker a game.
#[derive(Debug, Deserialize)]
pub struct Assignment {
    /// The session id to create. Ordinarily the checked-in candidate, but
    /// the matchmaker is free to substitute one of its own.
    pub session_id: String,
}

/// A collaborator reachable over HTTP that owns fleet-wide capacity
/// planning. Only the check-in/assignment protocol lives here; the
/// matchmaker's own matching logic is an external system out of scope for
/// this crate.
pub trait MatchmakerClient: Send + Sync {
    fn check_in<'a>(
        &'a self,
        request: &'a CheckIn,
    ) -> futures_util::future::BoxFuture<'a, Result<Option<Assignment>, MatchmakerError>>;
}

#[derive(Debug, Display, Error, From)]
pub enum MatchmakerError {
    #[display("matchmaker check-in failed: {_0}")]
    Transport(reqwest::Error),
    #[display("matchmaker response was not valid JSON: {_0}")]
    Decode(serde_json::Error),
}

impl MatchmakerError {
    /// Timeouts and connect failures are expected background noise per the
    /// poller's own retry contract; everything else is worth a louder log.
    pub fn is_transient(&self) -> bool {
        match self {
            MatchmakerError::Transport(error) => error.is_timeout() || error.is_connect(),
            MatchmakerError::Decode(_) => false,
        }
    }
}

/// Talks to a real external matchmaker over HTTP.
pub struct HttpMatchmakerClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMatchmakerClient {
    pub fn new(base_url: impl Into<String>) -> HttpMatchmakerClient {
        HttpMatchmakerClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl MatchmakerClient for HttpMatchmakerClient {
    fn check_in<'a>(
        &'a self,
        request: &'a CheckIn,
    ) -> futures_util::future::BoxFuture<'a, Result<Option<Assignment>, MatchmakerError>> {
        Box::pin(async move {
            let response = self
                .http
                .post(format!("{}/check-in", self.base_url))
                .json(request)
                .send()
                .await?
                .error_for_status()?;

            if response.status() == reqwest::StatusCode::NO_CONTENT {
                return Ok(None);
            }

            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(None);
            }

            Ok(Some(serde_json::from_slice(&bytes)?))
        })
    }
}

/// Used when no matchmaker is configured: every check-in is a no-op, so the
/// poller idles without producing public sessions.
pub struct DisabledMatchmakerClient;

impl MatchmakerClient for DisabledMatchmakerClient {
    fn check_in<'a>(
        &'a self,
        _request: &'a CheckIn,
    ) -> futures_util::future::BoxFuture<'a, Result<Option<Assignment>, MatchmakerError>> {
        Box::pin(async { Ok(None) })
    }
}

/// The shared config every matchmaker-assigned public session starts with.
fn playlist_config(humans: u32) -> SessionConfig {
    SessionConfig {
        map: "playlist_ffa".into(),
        map_size: MapSize::Medium,
        difficulty: GameDifficulty::Medium,
        mode: GameMode::FreeForAll,
        game_type: GameType::Public,
        bot_count: 0,
        max_players: Some(humans.max(1)),
        disabled_units: Default::default(),
        team_assignments: Default::default(),
        toggles: Default::default(),
        prestart_seconds: None,
        spawn_immunity_seconds: None,
        allow_list: None,
        required_roles: None,
    }
}

/// A system identity that owns matchmaker-assigned sessions; no human
/// creator is known until clients stream their join.
fn system_creator() -> PersistentId {
    PersistentId("matchmaker".into())
}

pub struct MatchmakingPoller {
    worker_id: u32,
    num_workers: u32,
    client: Arc<dyn MatchmakerClient>,
    sessions: Arc<SessionManager>,
    check_in_interval: Duration,
    start_delay: Duration,
}

impl MatchmakingPoller {
    pub fn new(
        worker_id: u32,
        num_workers: u32,
        client: Arc<dyn MatchmakerClient>,
        sessions: Arc<SessionManager>,
        config: &MatchmakerConfig,
    ) -> MatchmakingPoller {
        MatchmakingPoller {
            worker_id,
            num_workers,
            client,
            sessions,
            check_in_interval: config
                .check_in_interval
                .to_std()
                .unwrap_or(Duration::from_secs(5)),
            start_delay: config
                .assignment_start_delay
                .to_std()
                .unwrap_or(Duration::from_secs(7)),
        }
    }

    /// Spawns the check-in loop. Call once, at worker startup.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let jitter = Duration::from_millis(rand::rng().random_range(0..1_000));
                tokio::time::sleep(self.check_in_interval + jitter).await;
                self.tick().await;
            }
        });
    }

    /// One check-in: announces capacity, and on assignment creates the
    /// session immediately, scheduling its start after `start_delay`.
    async fn tick(&self) {
        let ccu = self.sessions.concurrent_clients().await;
        let candidate_session_id = self.fresh_candidate_session_id();

        let request = CheckIn {
            worker_id: self.worker_id,
            ccu,
            candidate_session_id,
        };

        match self.client.check_in(&request).await {
            Ok(Some(assignment)) => self.on_assigned(assignment).await,
            Ok(None) => {}
            Err(error) if error.is_transient() => {
                tracing::debug!(%error, "matchmaker check-in timed out or was unreachable, retrying next tick");
            }
            Err(error) => {
                tracing::warn!(%error, "matchmaker check-in failed");
            }
        }
    }

    async fn on_assigned(&self, assignment: Assignment) {
        let session_id = assignment.session_id;
        let sessions = Arc::clone(&self.sessions);
        let config = playlist_config(4);
        let start_delay = self.start_delay;

        tracing::info!(session_id = %session_id, "matchmaker assigned a public session");

        let session = sessions.create(session_id, config, system_creator()).await;

        tokio::spawn(async move {
            tokio::time::sleep(start_delay).await;
            session.request_start().await;
        });
    }

    fn fresh_candidate_session_id(&self) -> String {
        loop {
            let candidate = format!("public-{}", uuid::Uuid::new_v4());
            if shard::worker_for(&candidate, self.num_workers) == self.worker_id {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::archive::InMemoryArchiveSink;

    struct RecordingClient {
        responses: Mutex<Vec<Option<Assignment>>>,
        requests: Mutex<Vec<CheckIn>>,
    }

    impl MatchmakerClient for RecordingClient {
        fn check_in<'a>(
            &'a self,
            request: &'a CheckIn,
        ) -> futures_util::future::BoxFuture<'a, Result<Option<Assignment>, MatchmakerError>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(CheckIn {
                    worker_id: request.worker_id,
                    ccu: request.ccu,
                    candidate_session_id: request.candidate_session_id.clone(),
                });
                Ok(self.responses.lock().unwrap().pop())
            })
        }
    }

    fn test_config() -> MatchmakerConfig {
        MatchmakerConfig {
            base_url: None,
            check_in_interval: chrono::TimeDelta::seconds(5),
            assignment_start_delay: chrono::TimeDelta::milliseconds(10),
        }
    }

    #[tokio::test]
    async fn a_check_in_with_no_assignment_creates_no_session() {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemoryArchiveSink::new()),
            Duration::from_millis(10),
        ));
        let client = Arc::new(RecordingClient {
            responses: Mutex::new(vec![None]),
            requests: Mutex::new(Vec::new()),
        });
        let poller = MatchmakingPoller::new(0, 1, client, Arc::clone(&sessions), &test_config());

        poller.tick().await;

        assert!(sessions.public_lobbies().await.is_empty());
    }

    #[tokio::test]
    async fn an_assignment_creates_a_session_that_starts_after_the_delay() {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemoryArchiveSink::new()),
            Duration::from_millis(10),
        ));
        let client = Arc::new(RecordingClient {
            responses: Mutex::new(vec![Some(Assignment { session_id: "public-fixed".into() })]),
            requests: Mutex::new(Vec::new()),
        });
        let poller = MatchmakingPoller::new(0, 1, client, Arc::clone(&sessions), &test_config());

        poller.tick().await;

        let session = sessions.lookup("public-fixed").await.expect("session was created");
        assert!(!session.start_was_requested().await, "start is delayed, not immediate");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.start_was_requested().await);
    }

    #[test]
    fn fresh_candidate_session_id_always_hashes_to_this_worker() {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemoryArchiveSink::new()),
            Duration::from_secs(1),
        ));
        let poller = MatchmakingPoller::new(
            2,
            4,
            Arc::new(DisabledMatchmakerClient),
            sessions,
            &test_config(),
        );

        for _ in 0..20 {
            let id = poller.fresh_candidate_session_id();
            assert_eq!(shard::worker_for(&id, 4), 2);
        }
    }
}
