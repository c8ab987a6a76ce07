//! Owns the map from session id to live [`Session`], and drives the
//! prestart/start/end choreography that would otherwise have to live inside
//! the turn engine itself.
//!
//! The teacher only ever served a single process-wide `Room`; this
//! generalizes that singleton into a registry, following the same
//! `Arc`-wrapped-state, cheaply-cloneable-handle shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use turnkeep_model::session::{PersistentId, SessionConfig, SessionInfo};

use crate::archive::ArchiveSink;
use crate::session::{Phase, Session};

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    archive: Arc<dyn ArchiveSink>,
    turn_interval: Duration,
}

impl SessionManager {
    pub fn new(archive: Arc<dyn ArchiveSink>, turn_interval: Duration) -> SessionManager {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            archive,
            turn_interval,
        }
    }

    /// Spawns the 1Hz phase-polling tick. Call once, at worker startup.
    pub fn spawn_tick(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                manager.tick().await;
            }
        });
    }

    pub async fn create(
        &self,
        id: String,
        config: SessionConfig,
        creator: PersistentId,
    ) -> Session {
        let session = Session::new(
            id.clone(),
            config,
            creator,
            Arc::clone(&self.archive),
            self.turn_interval,
        );
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    pub async fn lookup(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Every public lobby still in `Lobby`.
    pub async fn public_lobbies(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::new();
        for session in sessions {
            if session.is_public_lobby().await {
                infos.push(session.info().await);
            }
        }
        infos
    }

    /// Total connected clients across every session this worker hosts, the
    /// CCU figure the matchmaking poller announces on check-in.
    pub async fn concurrent_clients(&self) -> u32 {
        let sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let mut total = 0;
        for session in sessions {
            total += session.info().await.num_clients;
        }
        total
    }

    /// Polls every session's phase: gives a freshly start-requested lobby
    /// its prestart countdown, starts it after the grace period, ends an
    /// `Active` session once every client has left, and forgets any session
    /// that has reached `Finished`.
    async fn tick(&self) {
        let sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let mut finished = Vec::new();

        for session in sessions {
            match session.phase().await {
                Phase::Lobby => {
                    if session.start_was_requested().await && !session.prestart_issued().await {
                        let starting = session.clone();
                        tokio::spawn(async move {
                            starting.prestart().await;
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            starting.start().await;
                        });
                    }
                }
                Phase::Active => {
                    if session.is_empty().await {
                        session.end().await;
                    }
                }
                Phase::Finished => {}
            }

            if session.phase().await == Phase::Finished {
                finished.push(session.id().to_string());
            }
        }

        if !finished.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in finished {
                sessions.remove(&id);
            }
        }
    }
}
