//! The per-session turn engine: lobby admission, the turn pump, hash
//! reconciliation, liveness sweeps, and winner-vote adoption.
//!
//! Structurally this follows the teacher's `room::Room`/`Handle` split — a
//! cheaply-cloneable handle wraps an `Arc` to shared state and hands out a
//! broadcast `Receiver` to every served stream — but the lobby/turn-pump
//! bookkeeping below has no teacher analogue; the teacher's `Room` only ever
//! carried a single optional `Battle`, not a running turn log.

pub mod client;
pub mod protocol;
pub mod reconcile;

pub use protocol::WebSocket;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use derive_more::{Display, Error};

use tokio::sync::{Mutex, RwLock, broadcast};

use tracing::instrument;

use turnkeep_model::session::{
    ClientId, GameStartInfo, GameType, Intent, PersistentId, RosterEntry, SessionConfig,
    SessionConfigPatch, SessionInfo, TeamId, Turn, WinnerDescriptor,
    intent::{KickPlayerIntent, MarkDisconnectedIntent, SendWinnerIntent, TogglePauseIntent},
};

use crate::archive::ArchiveSink;
use client::ClientHandle;
use reconcile::MajorityTracker;

/// Every `RECONCILE_INTERVAL` turns, the turn `RECONCILE_LOOKBACK` turns ago
/// becomes the reconciliation turn.
const RECONCILE_INTERVAL: u64 = 10;
const RECONCILE_LOOKBACK: u64 = 10;
/// Hash entries older than this (relative to the current turn) are pruned
/// per client to bound memory.
const HASH_PRUNE_AGE: u64 = 20;
const LIVENESS_INTERVAL: u64 = 5;
const DISCONNECT_THRESHOLD: Duration = Duration::from_secs(30);
const EVICTION_THRESHOLD: Duration = Duration::from_secs(60);
/// Public-game IP fan-out cap: at most this many distinct clients share one
/// source address.
const MAX_CLIENTS_PER_IP: usize = 3;

/// The three states a session's lifecycle passes through, in order.
/// `Finished` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Lobby,
    Active,
    Finished,
}

/// An open session.
///
/// Cheaply cloneable; serves as a master object that can admit clients and
/// lease broadcast handles to their WebSocket tasks.
#[derive(Clone)]
pub struct Session {
    state: Arc<SessionState>,
}

struct SessionState {
    id: String,
    creator: PersistentId,
    config: RwLock<SessionConfig>,
    phase: RwLock<Phase>,
    /// Set once the HTTP control plane has requested a start; the
    /// prestart/start choreography (owned by the session manager) uses this
    /// to notice a session that just became ready, without the manager
    /// reaching into the turn pump itself.
    start_requested: RwLock<bool>,
    prestart_issued: RwLock<bool>,
    start_info: RwLock<Option<GameStartInfo>>,

    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    persistent_index: RwLock<HashMap<PersistentId, ClientId>>,
    /// Persistent ids explicitly banned via `KickClient`; a plain disconnect
    /// or eviction never adds an entry here, since those still permit a
    /// reconnect.
    kicked: RwLock<HashSet<PersistentId>>,
    next_client_seq: AtomicU64,

    turns: RwLock<Vec<Turn>>,
    pending_intents: Mutex<Vec<Intent>>,
    paused: RwLock<bool>,

    hash_trackers: Mutex<HashMap<u64, MajorityTracker<u64>>>,
    desync_sent: Mutex<HashSet<u64>>,
    /// Clients currently considered out of sync by the most recent
    /// reconciliation. Consulted (alongside the kick set, which is implicit
    /// via removal from `clients`) so a `send-winner` vote from a client the
    /// server doesn't trust doesn't count toward adoption.
    out_of_sync: RwLock<HashSet<ClientId>>,

    /// Per-candidate distinct-IP ballot box for `send-winner` votes, keyed
    /// by the candidate's canonical [`WinnerDescriptor::vote_key`].
    winner_votes: Mutex<HashMap<String, WinnerBallot>>,
    winner_adopted: Mutex<bool>,
    adopted_winner: Mutex<Option<WinnerDescriptor>>,

    archive: Arc<dyn ArchiveSink>,
    turn_interval: Duration,

    tx: broadcast::Sender<SessionEvent>,
}

struct WinnerBallot {
    descriptor: WinnerDescriptor,
    voters: HashMap<ClientId, IpAddr>,
}

/// A handle to a session's broadcast stream.
pub struct Handle {
    rx: broadcast::Receiver<SessionEvent>,
}

#[derive(Clone, Debug)]
enum SessionEvent {
    LobbyInfo(SessionInfo),
    Prestart { seconds_remaining: u32 },
    Start(GameStartInfo),
    Turn(Turn),
    Desync {
        turn_number: u64,
        correct_hash: u64,
        clients_with_correct_hash: u32,
        total_active_clients: u32,
        affected: HashSet<ClientId>,
    },
    Kicked { client_id: ClientId, reason: String },
    Ended,
}

#[derive(Debug, Display, Error)]
pub enum JoinError {
    #[display("kicked from this session")]
    Kicked,
    #[display("session is full")]
    Full,
    #[display("too many clients from this address")]
    DuplicateIp,
}

#[derive(Debug, Display, Error)]
pub enum RejoinError {
    #[display("no such client in this session")]
    NotFound,
}

#[derive(Debug, Display, Error)]
pub enum UpdateConfigError {
    #[display("session has already started")]
    InvalidState,
    #[display("only the lobby creator may update the config")]
    Forbidden,
}

impl Session {
    pub fn new(
        id: String,
        config: SessionConfig,
        creator: PersistentId,
        archive: Arc<dyn ArchiveSink>,
        turn_interval: Duration,
    ) -> Session {
        let (tx, _rx) = broadcast::channel(256);

        Session {
            state: Arc::new(SessionState {
                id,
                creator,
                config: RwLock::new(config),
                phase: RwLock::new(Phase::Lobby),
                start_requested: RwLock::new(false),
                prestart_issued: RwLock::new(false),
                start_info: RwLock::new(None),
                clients: RwLock::new(HashMap::new()),
                persistent_index: RwLock::new(HashMap::new()),
                kicked: RwLock::new(HashSet::new()),
                next_client_seq: AtomicU64::new(0),
                turns: RwLock::new(Vec::new()),
                pending_intents: Mutex::new(Vec::new()),
                paused: RwLock::new(false),
                hash_trackers: Mutex::new(HashMap::new()),
                desync_sent: Mutex::new(HashSet::new()),
                out_of_sync: RwLock::new(HashSet::new()),
                winner_votes: Mutex::new(HashMap::new()),
                winner_adopted: Mutex::new(false),
                adopted_winner: Mutex::new(None),
                archive,
                turn_interval,
                tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub async fn phase(&self) -> Phase {
        *self.state.phase.read().await
    }

    pub async fn is_public_lobby(&self) -> bool {
        *self.state.phase.read().await == Phase::Lobby
            && self.state.config.read().await.game_type == GameType::Public
    }

    pub async fn info(&self) -> SessionInfo {
        let config = self.state.config.read().await.clone();
        let clients = self.state.clients.read().await;
        let phase = *self.state.phase.read().await;

        SessionInfo {
            id: self.state.id.clone(),
            num_clients: clients.values().filter(|c| c.is_connected()).count() as u32,
            max_players: config.max_players,
            has_started: phase != Phase::Lobby,
            has_ended: phase == Phase::Finished,
            config,
        }
    }

    /// Whether every client has disconnected or been evicted. The session
    /// manager ends an `Active` session once this holds, since there is no
    /// one left to observe further turns.
    pub async fn is_empty(&self) -> bool {
        self.state.clients.read().await.is_empty()
    }

    fn subscribe(&self) -> Handle {
        Handle {
            rx: self.state.tx.subscribe(),
        }
    }

    pub async fn is_creator(&self, persistent_id: &PersistentId) -> bool {
        persistent_id == &self.state.creator
    }

    /// The winner adopted by majority vote, if any. Populated once
    /// [`Session::adopt_winner`] has run; read by the ranked coordinator
    /// once the session reaches [`Phase::Finished`].
    pub async fn winner(&self) -> Option<WinnerDescriptor> {
        self.state.adopted_winner.lock().await.clone()
    }

    /// The persistent id currently holding a given client id, if any. The
    /// ranked coordinator uses this to translate an adopted
    /// [`WinnerDescriptor`] (keyed by client id) back to the player ids a
    /// match's participants were persisted under.
    pub async fn persistent_id_for(&self, client_id: &ClientId) -> Option<PersistentId> {
        self.state
            .persistent_index
            .read()
            .await
            .iter()
            .find(|(_, c)| *c == client_id)
            .map(|(p, _)| p.clone())
    }

    /// Resolves once this session reaches [`Phase::Finished`], for a
    /// caller (the ranked coordinator) that needs to react to completion
    /// without polling. Resolves immediately if already finished.
    pub async fn wait_until_finished(&self) {
        if *self.state.phase.read().await == Phase::Finished {
            return;
        }
        let mut handle = self.subscribe();
        loop {
            match handle.rx.recv().await {
                Ok(SessionEvent::Ended) => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }

    /// Admits a new stream under a fresh [`ClientId`].
    ///
    /// Returns the minted id, a broadcast handle, and — if the session has
    /// already started — the frozen [`GameStartInfo`] plus every turn from
    /// `last_seen_turn` onward, so the caller's serve loop can replay it in
    /// one `Start` message.
    #[instrument(skip(self))]
    pub async fn join_client(
        &self,
        persistent_id: PersistentId,
        display_name: String,
        team: Option<TeamId>,
        ip: IpAddr,
        last_seen_turn: u64,
    ) -> Result<(ClientId, Handle, Option<(GameStartInfo, Vec<Turn>)>), JoinError> {
        if self.state.kicked.read().await.contains(&persistent_id) {
            return Err(JoinError::Kicked);
        }

        let mut clients = self.state.clients.write().await;

        {
            let config = self.state.config.read().await;
            if let Some(max_players) = config.max_players {
                let connected = clients.values().filter(|c| c.is_connected()).count() as u32;
                if connected >= max_players {
                    return Err(JoinError::Full);
                }
            }

            if config.game_type == GameType::Public {
                let from_ip = clients.values().filter(|c| c.ip == ip).count();
                if from_ip >= MAX_CLIENTS_PER_IP {
                    return Err(JoinError::DuplicateIp);
                }
            }
        }

        // A second join for an already-connected persistent id favours the
        // new arrival: the prior stream is told to close, freeing the seat.
        let mut index = self.state.persistent_index.write().await;
        if let Some(old_client_id) = index.get(&persistent_id).cloned() {
            clients.remove(&old_client_id);
            let _ = self.state.tx.send(SessionEvent::Kicked {
                client_id: old_client_id,
                reason: "reconnected from another stream".into(),
            });
        }

        let seq = self.state.next_client_seq.fetch_add(1, Ordering::Relaxed);
        let client_id = ClientId(format!("{}-{seq}", self.state.id));

        let mut handle = ClientHandle::new(
            client_id.clone(),
            persistent_id.clone(),
            display_name,
            team,
            ip,
        );
        handle.last_seen_turn = last_seen_turn;
        clients.insert(client_id.clone(), handle);
        index.insert(persistent_id, client_id.clone());
        drop(index);
        drop(clients);

        let catch_up = self.catch_up_from(last_seen_turn).await;

        Ok((client_id, self.subscribe(), catch_up))
    }

    /// Re-attaches a fresh stream to an existing (disconnected) client
    /// entry, picking the turn stream back up from `last_seen_turn`.
    #[instrument(skip(self))]
    pub async fn rejoin_client(
        &self,
        persistent_id: &PersistentId,
        ip: IpAddr,
        last_seen_turn: u64,
    ) -> Result<(ClientId, Handle, Option<(GameStartInfo, Vec<Turn>)>), RejoinError> {
        let index = self.state.persistent_index.read().await;
        let client_id = index
            .get(persistent_id)
            .cloned()
            .ok_or(RejoinError::NotFound)?;
        drop(index);

        let mut clients = self.state.clients.write().await;
        let Some(entry) = clients.get_mut(&client_id) else {
            return Err(RejoinError::NotFound);
        };
        entry.disconnected_at = None;
        entry.ip = ip;
        entry.last_ping = Utc::now();
        entry.last_seen_turn = last_seen_turn;
        drop(clients);

        let catch_up = self.catch_up_from(last_seen_turn).await;

        Ok((client_id, self.subscribe(), catch_up))
    }

    async fn catch_up_from(&self, last_seen_turn: u64) -> Option<(GameStartInfo, Vec<Turn>)> {
        let start_info = self.state.start_info.read().await.clone()?;
        let turns = self.state.turns.read().await;
        let turns = turns
            .iter()
            .skip(last_seen_turn as usize)
            .cloned()
            .collect();
        Some((start_info, turns))
    }

    /// Applies a partial config patch. Only valid in `Lobby`, and only for
    /// the lobby creator. Flipping a private game public is structurally
    /// impossible here: [`SessionConfigPatch`] has no `game_type` field.
    pub async fn update_config(
        &self,
        requester: &PersistentId,
        patch: SessionConfigPatch,
    ) -> Result<SessionInfo, UpdateConfigError> {
        if *self.state.phase.read().await != Phase::Lobby {
            return Err(UpdateConfigError::InvalidState);
        }
        if !self.is_creator(requester).await {
            return Err(UpdateConfigError::Forbidden);
        }

        self.state.config.write().await.apply_patch(patch);

        let info = self.info().await;
        let _ = self.state.tx.send(SessionEvent::LobbyInfo(info.clone()));
        Ok(info)
    }

    /// Idempotent. Closes the stream (if attached) with `reason` and bans
    /// the persistent id from rejoining.
    pub async fn kick_client(&self, client_id: ClientId, reason: impl Into<String>) {
        let reason = reason.into();

        let mut clients = self.state.clients.write().await;
        if let Some(handle) = clients.remove(&client_id) {
            self.state.kicked.write().await.insert(handle.persistent_id);
        }
        drop(clients);

        let _ = self.state.tx.send(SessionEvent::Kicked { client_id, reason });
    }

    /// Marks this session ready to start; called once by the `/api/start_game`
    /// route. Idempotent — a second call is a no-op.
    pub async fn request_start(&self) {
        *self.state.start_requested.write().await = true;
    }

    pub async fn start_was_requested(&self) -> bool {
        *self.state.start_requested.read().await
    }

    pub async fn prestart_issued(&self) -> bool {
        *self.state.prestart_issued.read().await
    }

    /// Broadcasts the prestart countdown. Called once by the session
    /// manager after it notices `start_requested`.
    pub async fn prestart(&self) {
        *self.state.prestart_issued.write().await = true;
        let seconds = self
            .state
            .config
            .read()
            .await
            .prestart_seconds
            .unwrap_or(2);
        let _ = self
            .state
            .tx
            .send(SessionEvent::Prestart { seconds_remaining: seconds });
    }

    /// Freezes the roster and config into [`GameStartInfo`], transitions to
    /// `Active`, and spawns the turn pump. One-shot; a second call is a
    /// no-op.
    pub async fn start(&self) {
        let mut phase = self.state.phase.write().await;
        if *phase != Phase::Lobby {
            return;
        }
        *phase = Phase::Active;
        drop(phase);

        let config = self.state.config.read().await.clone();
        let roster: Vec<RosterEntry> = self
            .state
            .clients
            .read()
            .await
            .values()
            .map(ClientHandle::to_roster_entry)
            .collect();

        let info = GameStartInfo { config, roster };
        *self.state.start_info.write().await = Some(info.clone());

        let _ = self.state.tx.send(SessionEvent::Start(info));

        tokio::spawn(run_turn_pump(self.clone()));
    }

    /// Stops the turn pump, closes every stream with code 1000, and, if the
    /// session ever started with at least one client, emits the final
    /// archive record. One-shot.
    pub async fn end(&self) {
        let mut phase = self.state.phase.write().await;
        if *phase == Phase::Finished {
            return;
        }
        let had_started = *phase == Phase::Active;
        *phase = Phase::Finished;
        drop(phase);

        if had_started {
            if let Err(error) = self.state.archive.finalize(&self.state.id).await {
                tracing::error!(session_id = %self.state.id, %error, "archive finalize failed");
            }
        }

        let _ = self.state.tx.send(SessionEvent::Ended);
    }

    /// Queues one intent for the next turn, dispatching the handful of
    /// control intents the engine itself interprets.
    pub async fn submit_intent(&self, intent: Intent) {
        match &intent {
            Intent::UpdateConfig(update) => {
                if *self.state.phase.read().await != Phase::Lobby {
                    tracing::debug!("dropping update-config intent outside lobby");
                    return;
                }
                if !self.is_client_creator(&update.client_id).await {
                    tracing::debug!("dropping update-config intent from non-creator");
                    return;
                }
                self.state
                    .config
                    .write()
                    .await
                    .apply_patch(update.patch.clone());
            }
            Intent::TogglePause(toggle) => {
                self.apply_toggle_pause(toggle).await;
            }
            Intent::KickPlayer(kick) => {
                self.apply_kick_intent(kick).await;
                return; // kick_client already queues its own event; the
                // kick intent itself still gets queued below so every
                // client observes *why* at the same turn.
            }
            Intent::MarkDisconnected(_) => {
                tracing::debug!("dropping client-submitted mark-disconnected intent");
                return;
            }
            Intent::SendWinner(vote) => {
                self.record_winner_vote(vote.clone(), None).await;
            }
            Intent::Unknown => {
                tracing::debug!("dropping unrecognized intent tag");
                return;
            }
            _ => {}
        }

        self.state.pending_intents.lock().await.push(intent);
    }

    async fn is_client_creator(&self, client_id: &ClientId) -> bool {
        match self.state.clients.read().await.get(client_id) {
            Some(handle) => handle.persistent_id == self.state.creator,
            None => false,
        }
    }

    async fn apply_toggle_pause(&self, toggle: &TogglePauseIntent) {
        // Unpause clears the flag before the intent is queued, so the very
        // next tick already carries the un-paused world forward.
        *self.state.paused.write().await = toggle.paused;
    }

    async fn apply_kick_intent(&self, kick: &KickPlayerIntent) {
        if !self.is_client_creator(&kick.client_id).await {
            tracing::debug!("dropping kick-player intent from non-creator");
            return;
        }
        let reason = kick.reason.clone().unwrap_or_else(|| "kicked".into());
        self.kick_client(kick.target.clone(), reason).await;
    }

    /// Records a client's ping for the liveness sweep. Also clears a
    /// previously-disconnected client back to connected, symmetric with the
    /// sweep's disconnect transition.
    pub async fn record_ping(&self, client_id: &ClientId) {
        let mut clients = self.state.clients.write().await;
        if let Some(handle) = clients.get_mut(client_id) {
            handle.last_ping = Utc::now();
            if handle.disconnected_at.is_some() {
                handle.disconnected_at = None;
                let intent = Intent::MarkDisconnected(MarkDisconnectedIntent {
                    client_id: client_id.clone(),
                    disconnected: false,
                });
                drop(clients);
                self.state.pending_intents.lock().await.push(intent);
            }
        }
    }

    /// Records a client's reported hash for a turn, for reconciliation.
    pub async fn submit_hash(&self, client_id: ClientId, turn_number: u64, hash: u64) {
        let mut trackers = self.state.hash_trackers.lock().await;
        trackers
            .entry(turn_number)
            .or_insert_with(MajorityTracker::new)
            .record(client_id, hash);
    }

    /// Records one client's vote for how the match ended, and checks for
    /// adoption. Ignored for clients in the kick set; a client may vote at
    /// most once.
    pub async fn submit_winner(
        &self,
        client_id: ClientId,
        winner: WinnerDescriptor,
        stats: std::collections::BTreeMap<String, serde_json::Value>,
    ) {
        let Some(ip) = self.state.clients.read().await.get(&client_id).map(|c| c.ip) else {
            return;
        };
        self.record_winner_vote(
            SendWinnerIntent {
                client_id: client_id.clone(),
                winner,
                stats,
            },
            Some(ip),
        )
        .await;
    }

    async fn record_winner_vote(&self, vote: SendWinnerIntent, ip: Option<IpAddr>) {
        if *self.state.winner_adopted.lock().await {
            return;
        }

        if self.state.out_of_sync.read().await.contains(&vote.client_id) {
            return;
        }

        let ip = match ip {
            Some(ip) => ip,
            None => match self.state.clients.read().await.get(&vote.client_id).map(|c| c.ip) {
                Some(ip) => ip,
                None => return,
            },
        };

        let key = vote.winner.vote_key();
        let mut votes = self.state.winner_votes.lock().await;
        let ballot = votes.entry(key).or_insert_with(|| WinnerBallot {
            descriptor: vote.winner.clone(),
            voters: HashMap::new(),
        });
        ballot.voters.insert(vote.client_id.clone(), ip);

        let active_ips: HashSet<IpAddr> = self
            .state
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.ip)
            .collect();

        let adopted_candidate = if active_ips.is_empty() {
            None
        } else {
            let mut found = None;
            for ballot in votes.values() {
                let distinct_ips: HashSet<IpAddr> = ballot
                    .voters
                    .values()
                    .filter(|ip| active_ips.contains(ip))
                    .copied()
                    .collect();

                if distinct_ips.len() * 2 >= active_ips.len() {
                    found = Some(ballot.descriptor.clone());
                    break;
                }
            }
            found
        };
        drop(votes);

        if let Some(descriptor) = adopted_candidate {
            self.adopt_winner(descriptor, vote.stats).await;
        }
    }

    async fn adopt_winner(
        &self,
        winner: WinnerDescriptor,
        stats: std::collections::BTreeMap<String, serde_json::Value>,
    ) {
        let mut adopted = self.state.winner_adopted.lock().await;
        if *adopted {
            return;
        }
        *adopted = true;
        drop(adopted);

        *self.state.adopted_winner.lock().await = Some(winner.clone());

        self.state
            .pending_intents
            .lock()
            .await
            .push(Intent::SendWinner(SendWinnerIntent {
                client_id: ClientId("session".into()),
                winner,
                stats,
            }));

        if let Err(error) = self.state.archive.finalize(&self.state.id).await {
            tracing::error!(session_id = %self.state.id, %error, "archive finalize on winner adoption failed");
        }
    }
}

/// Drives the fixed-interval turn pump for one session, from `Start()`
/// until `End()`.
async fn run_turn_pump(session: Session) {
    let mut ticker = tokio::time::interval(session.state.turn_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if *session.state.phase.read().await != Phase::Active {
            return;
        }

        if *session.state.paused.read().await {
            continue;
        }

        let turn_number = session.state.turns.read().await.len() as u64;
        let intents = std::mem::take(&mut *session.state.pending_intents.lock().await);
        let mut turn = Turn {
            turn_number,
            intents,
            hash: None,
        };

        if turn_number > 0 && turn_number % RECONCILE_INTERVAL == 0 {
            session.run_reconciliation(turn_number).await;
        }
        if turn_number > 0 && turn_number % LIVENESS_INTERVAL == 0 {
            session.run_liveness_sweep().await;
        }

        session.state.turns.write().await.push(turn.clone());

        if let Err(error) = session.state.archive.append_turn(&session.state.id, &turn).await {
            tracing::error!(session_id = %session.state.id, %error, "archive append_turn failed");
        }

        let _ = session.state.tx.send(SessionEvent::Turn(turn));
    }
}

impl Session {
    async fn run_reconciliation(&self, current_turn: u64) {
        let reconcile_turn = current_turn.saturating_sub(RECONCILE_LOOKBACK);

        let mut trackers = self.state.hash_trackers.lock().await;
        let Some(tracker) = trackers.remove(&reconcile_turn) else {
            return;
        };

        let active_count = self
            .state
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count();

        // Prune stale entries unconditionally, whether or not this turn
        // resolves.
        trackers.retain(|turn_number, _| reconcile_turn.saturating_sub(*turn_number) <= HASH_PRUNE_AGE);
        drop(trackers);

        let Some((correct_hash, agreeing)) = tracker.resolve(active_count.max(1)) else {
            return;
        };

        let agreeing: HashSet<ClientId> = agreeing.into_iter().collect();
        let all_clients: Vec<ClientId> = {
            let clients = self.state.clients.read().await;
            clients
                .iter()
                .filter(|(_, c)| c.is_connected())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut out_of_sync: HashSet<ClientId> = all_clients
            .iter()
            .filter(|id| !agreeing.contains(*id))
            .cloned()
            .collect();

        // If half or more of active clients are out of sync, the server's
        // own majority pick is treated as unreliable and every client is
        // considered out of sync.
        if agreeing.len() * 2 <= active_count {
            out_of_sync = all_clients.into_iter().collect();
        }

        // The adopted hash is written back, and the out-of-sync set
        // replaced, unconditionally: late joiners need the canonical hash
        // even when no client was actually out of sync this round, and
        // winner-vote adoption needs an up-to-date trust set either way.
        if let Some(stored) = self.state.turns.write().await.get_mut(reconcile_turn as usize) {
            stored.hash = Some(correct_hash);
        }
        *self.state.out_of_sync.write().await = out_of_sync.clone();

        let mut sent = self.state.desync_sent.lock().await;
        if sent.contains(&reconcile_turn) {
            return;
        }
        sent.insert(reconcile_turn);
        drop(sent);

        if out_of_sync.is_empty() {
            return;
        }

        let _ = self.state.tx.send(SessionEvent::Desync {
            turn_number: reconcile_turn,
            correct_hash,
            clients_with_correct_hash: agreeing.len() as u32,
            total_active_clients: active_count as u32,
            affected: out_of_sync,
        });
    }

    async fn run_liveness_sweep(&self) {
        let now = Utc::now();
        let mut disconnected = Vec::new();
        let mut evicted = Vec::new();

        {
            let mut clients = self.state.clients.write().await;
            for (client_id, handle) in clients.iter_mut() {
                let idle = now.signed_duration_since(handle.last_ping);
                let idle = idle.to_std().unwrap_or(Duration::ZERO);

                if idle >= EVICTION_THRESHOLD {
                    evicted.push(client_id.clone());
                } else if idle >= DISCONNECT_THRESHOLD && handle.disconnected_at.is_none() {
                    handle.disconnected_at = Some(now);
                    disconnected.push(client_id.clone());
                }
            }
            for client_id in &evicted {
                clients.remove(client_id);
            }
        }

        for client_id in disconnected {
            self.state
                .pending_intents
                .lock()
                .await
                .push(Intent::MarkDisconnected(MarkDisconnectedIntent {
                    client_id,
                    disconnected: true,
                }));
        }

        for client_id in evicted {
            let _ = self.state.tx.send(SessionEvent::Kicked {
                client_id,
                reason: "heartbeat timed out".into(),
            });
        }
    }
}

/// Serves one client's WebSocket connection for the lifetime of the stream,
/// starting with the join/rejoin handshake and then looping between the
/// client's own messages and the session's broadcast stream — the same
/// `tokio::select!` shape as the teacher's `room::serve`.
#[instrument(skip(ws, sessions, human_check))]
pub async fn serve(
    mut ws: WebSocket,
    sessions: Arc<crate::manager::SessionManager>,
    session_id: String,
    ip: IpAddr,
    human_check: Arc<dyn crate::auth::human_check::HumanCheck>,
) {
    let session = match sessions.lookup(&session_id).await {
        Some(session) => session,
        None => {
            let _ = ws
                .send_close(1002, &turnkeep_model::ApiError::new("no such session"))
                .await;
            return;
        }
    };

    let (client_id, mut handle, catch_up) =
        match perform_handshake(&mut ws, &session, ip, human_check.as_ref()).await {
            Ok(joined) => joined,
            Err(()) => return,
        };

    if let Some((info, turns)) = catch_up {
        if ws.send(&turnkeep_model::session::ServerMessage::Start { info, turns }).await.is_err() {
            return;
        }
    } else {
        let info = session.info().await;
        if ws
            .send(&turnkeep_model::session::ServerMessage::LobbyInfo { info })
            .await
            .is_err()
        {
            return;
        }
    }

    while !ws.is_closed() {
        tokio::select! {
            ev = ws.recv() => {
                match ev {
                    Some(Ok(message)) => {
                        if let Err(error) = handle_client_message(&session, &client_id, message).await {
                            tracing::warn!(%error, "ws error handling client message");
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(%error, "ws transport error");
                        let _ = ws.send_close(1011, &turnkeep_model::ApiError::new("internal error")).await;
                        break;
                    }
                    None => break,
                }
            }
            ev = handle.rx.recv() => {
                match ev {
                    Ok(event) => {
                        if handle_session_event(&mut ws, &client_id, event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session broadcast lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn perform_handshake(
    ws: &mut WebSocket,
    session: &Session,
    ip: IpAddr,
    human_check: &dyn crate::auth::human_check::HumanCheck,
) -> Result<(ClientId, Handle, Option<(GameStartInfo, Vec<Turn>)>), ()> {
    use turnkeep_model::session::ClientMessage;

    let Some(Ok(message)) = ws.recv().await else {
        return Err(());
    };

    let outcome = match message {
        ClientMessage::Join {
            persistent_id,
            display_name,
            last_seen_turn,
            turnstile_token,
            ..
        } => match human_check.verify(turnstile_token.as_deref()).await {
            Ok(true) => session
                .join_client(persistent_id, display_name, None, ip, last_seen_turn)
                .await
                .map_err(|error| error.to_string()),
            Ok(false) => Err("human verification failed".to_string()),
            Err(error) => {
                tracing::warn!(%error, "human check error");
                Err("human verification failed".to_string())
            }
        },
        ClientMessage::Rejoin {
            persistent_id,
            last_seen_turn,
            ..
        } => session
            .rejoin_client(&persistent_id, ip, last_seen_turn)
            .await
            .map_err(|error| error.to_string()),
        _ => Err("expected join or rejoin as the first message".to_string()),
    };

    match outcome {
        Ok(joined) => Ok(joined),
        Err(reason) => {
            let _ = ws
                .send_close(1002, &turnkeep_model::ApiError::new(reason))
                .await;
            Err(())
        }
    }
}

async fn handle_client_message(
    session: &Session,
    client_id: &ClientId,
    message: turnkeep_model::session::ClientMessage,
) -> Result<(), protocol::Error> {
    use turnkeep_model::session::ClientMessage;

    match message {
        ClientMessage::Ping { .. } => {
            session.record_ping(client_id).await;
        }
        ClientMessage::Intent { intent } => {
            if intent.client_id() != Some(client_id) {
                tracing::debug!("dropping intent with mismatched client id");
                return Ok(());
            }
            session.submit_intent(intent).await;
        }
        ClientMessage::Hash { turn_number, hash } => {
            session.submit_hash(client_id.clone(), turn_number, hash).await;
        }
        ClientMessage::Winner { winner, stats } => {
            session.submit_winner(client_id.clone(), winner, stats).await;
        }
        ClientMessage::Join { .. } | ClientMessage::Rejoin { .. } => {
            tracing::debug!("dropping out-of-sequence join/rejoin");
        }
    }
    Ok(())
}

async fn handle_session_event(
    ws: &mut WebSocket,
    client_id: &ClientId,
    event: SessionEvent,
) -> Result<(), protocol::Error> {
    use turnkeep_model::session::ServerMessage;

    match event {
        SessionEvent::LobbyInfo(info) => ws.send(&ServerMessage::LobbyInfo { info }).await,
        SessionEvent::Prestart { seconds_remaining } => {
            ws.send(&ServerMessage::Prestart { seconds_remaining }).await
        }
        SessionEvent::Start(info) => {
            ws.send(&ServerMessage::Start { info, turns: Vec::new() }).await
        }
        SessionEvent::Turn(turn) => ws.send(&ServerMessage::Turn { turn }).await,
        SessionEvent::Desync {
            turn_number,
            correct_hash,
            clients_with_correct_hash,
            total_active_clients,
            affected,
        } => {
            if affected.contains(client_id) {
                ws.send(&ServerMessage::Desync {
                    turn_number,
                    correct_hash,
                    clients_with_correct_hash,
                    total_active_clients,
                })
                .await
            } else {
                Ok(())
            }
        }
        SessionEvent::Kicked { client_id: target, reason } => {
            if &target == client_id {
                ws.send_close(1000, &turnkeep_model::ApiError::new(reason)).await?;
            }
            Ok(())
        }
        SessionEvent::Ended => {
            ws.send_close(1000, &turnkeep_model::ApiError::new("session ended")).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use turnkeep_model::session::config::{GameDifficulty, GameMode, MapSize};

    use crate::archive::InMemoryArchiveSink;

    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    fn test_config(game_type: GameType, max_players: Option<u32>) -> SessionConfig {
        SessionConfig {
            map: "test_map".into(),
            map_size: MapSize::Small,
            difficulty: GameDifficulty::Medium,
            mode: GameMode::FreeForAll,
            game_type,
            bot_count: 0,
            max_players,
            disabled_units: Default::default(),
            team_assignments: Default::default(),
            toggles: Default::default(),
            prestart_seconds: None,
            spawn_immunity_seconds: None,
            allow_list: None,
            required_roles: None,
        }
    }

    fn test_session(config: SessionConfig, turn_interval: Duration) -> Session {
        Session::new(
            "test-session".into(),
            config,
            PersistentId("creator".into()),
            Arc::new(InMemoryArchiveSink::new()),
            turn_interval,
        )
    }

    #[tokio::test]
    async fn join_client_admits_and_reports_in_info() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));

        let (client_id, _handle, catch_up) = session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(1), 0)
            .await
            .expect("join succeeds");

        assert!(catch_up.is_none(), "lobby join has nothing to catch up on");
        assert_eq!(client_id.0, "test-session-0");
        assert_eq!(session.info().await.num_clients, 1);
    }

    #[tokio::test]
    async fn full_session_rejects_further_joins() {
        let session = test_session(test_config(GameType::Public, Some(1)), Duration::from_secs(1));
        session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(1), 0)
            .await
            .expect("first join succeeds");

        let err = session
            .join_client(PersistentId("p2".into()), "Bob".into(), None, ip(2), 0)
            .await
            .expect_err("second join rejected");
        assert!(matches!(err, JoinError::Full));
    }

    #[tokio::test]
    async fn public_game_caps_distinct_clients_per_ip() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        for n in 0..MAX_CLIENTS_PER_IP {
            session
                .join_client(PersistentId(format!("p{n}")), "Alice".into(), None, ip(9), 0)
                .await
                .expect("within the per-ip cap");
        }

        let err = session
            .join_client(PersistentId("one-too-many".into()), "Eve".into(), None, ip(9), 0)
            .await
            .expect_err("cap exceeded");
        assert!(matches!(err, JoinError::DuplicateIp));
    }

    #[tokio::test]
    async fn rejoining_a_second_stream_evicts_the_first() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        let (first_id, mut first_handle, _) = session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(1), 0)
            .await
            .expect("first join succeeds");

        session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(2), 0)
            .await
            .expect("second join for the same persistent id succeeds");

        let event = first_handle.rx.recv().await.expect("kicked event delivered");
        assert!(matches!(
            event,
            SessionEvent::Kicked { client_id, .. } if client_id == first_id
        ));
        assert_eq!(session.info().await.num_clients, 1);
    }

    #[tokio::test]
    async fn kicked_client_cannot_rejoin() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        let (client_id, _handle, _) = session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(1), 0)
            .await
            .expect("join succeeds");

        session.kick_client(client_id, "because").await;

        let err = session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(1), 0)
            .await
            .expect_err("kicked persistent id rejected");
        assert!(matches!(err, JoinError::Kicked));
    }

    #[tokio::test(start_paused = true)]
    async fn turn_numbers_are_dense_and_strictly_increasing() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_millis(10));
        let mut handle = session.subscribe();
        session.start().await;

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match handle.rx.recv().await.expect("broadcast still open") {
                SessionEvent::Turn(turn) => seen.push(turn.turn_number),
                _ => continue,
            }
        }

        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn intents_submitted_between_ticks_land_in_the_next_turn() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_millis(10));
        let (client_id, _client_handle, _) = session
            .join_client(PersistentId("p1".into()), "Alice".into(), None, ip(1), 0)
            .await
            .expect("join succeeds");
        let mut handle = session.subscribe();
        session.start().await;

        session
            .submit_intent(Intent::MarkDisconnected(MarkDisconnectedIntent {
                client_id: client_id.clone(),
                disconnected: true,
            }))
            .await;

        loop {
            if let SessionEvent::Turn(turn) = handle.rx.recv().await.expect("broadcast still open") {
                assert!(
                    turn.intents
                        .iter()
                        .any(|i| matches!(i, Intent::MarkDisconnected(m) if m.client_id == client_id))
                );
                break;
            }
        }
    }

    #[tokio::test]
    async fn winner_is_adopted_once_half_of_active_ips_agree() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        let mut client_ids = Vec::new();
        for n in 0..4 {
            let (client_id, _handle, _) = session
                .join_client(PersistentId(format!("p{n}")), format!("p{n}"), None, ip(n as u8 + 1), 0)
                .await
                .expect("join succeeds");
            client_ids.push(client_id);
        }

        let winner = WinnerDescriptor::Player { id: client_ids[0].clone() };
        for client_id in &client_ids[..2] {
            session
                .submit_winner(client_id.clone(), winner.clone(), Default::default())
                .await;
        }

        assert_eq!(session.winner().await, Some(winner));
    }

    #[tokio::test]
    async fn a_vote_from_an_already_kicked_client_does_not_count() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        let mut client_ids = Vec::new();
        for n in 0..4 {
            let (client_id, _handle, _) = session
                .join_client(PersistentId(format!("p{n}")), format!("p{n}"), None, ip(n as u8 + 1), 0)
                .await
                .expect("join succeeds");
            client_ids.push(client_id);
        }
        session.kick_client(client_ids[1].clone(), "test").await;

        let winner = WinnerDescriptor::Player { id: client_ids[0].clone() };
        // The kicked client is no longer in the roster, so its own vote is a
        // silent no-op rather than counting toward adoption.
        session
            .submit_winner(client_ids[1].clone(), winner.clone(), Default::default())
            .await;
        assert_eq!(session.winner().await, None, "a kicked client's vote does not count");

        // Two of the three remaining active clients agreeing is a majority.
        session
            .submit_winner(client_ids[0].clone(), winner.clone(), Default::default())
            .await;
        session
            .submit_winner(client_ids[2].clone(), winner.clone(), Default::default())
            .await;
        assert_eq!(session.winner().await, Some(winner));
    }

    #[tokio::test]
    async fn a_vote_from_an_out_of_sync_client_does_not_count() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        let mut client_ids = Vec::new();
        for n in 0..4 {
            let (client_id, _handle, _) = session
                .join_client(PersistentId(format!("p{n}")), format!("p{n}"), None, ip(n as u8 + 1), 0)
                .await
                .expect("join succeeds");
            client_ids.push(client_id);
        }
        session
            .state
            .out_of_sync
            .write()
            .await
            .insert(client_ids[1].clone());

        let winner = WinnerDescriptor::Player { id: client_ids[0].clone() };
        // The out-of-sync client's vote is ignored entirely, same as a
        // kicked client's; two of the four active clients voting is still a
        // majority by IP count.
        session
            .submit_winner(client_ids[1].clone(), winner.clone(), Default::default())
            .await;
        assert_eq!(session.winner().await, None, "an out-of-sync client's vote does not count");

        session
            .submit_winner(client_ids[0].clone(), winner.clone(), Default::default())
            .await;
        session
            .submit_winner(client_ids[2].clone(), winner.clone(), Default::default())
            .await;
        assert_eq!(session.winner().await, Some(winner));
    }

    #[tokio::test]
    async fn reconciliation_adopts_a_plurality_and_flags_everyone_on_an_even_split() {
        let session = test_session(test_config(GameType::Public, None), Duration::from_secs(1));
        let mut client_ids = Vec::new();
        let mut handles = Vec::new();
        for n in 0..4 {
            let (client_id, handle, _) = session
                .join_client(PersistentId(format!("p{n}")), format!("p{n}"), None, ip(n as u8 + 1), 0)
                .await
                .expect("join succeeds");
            client_ids.push(client_id);
            handles.push(handle);
        }

        session.state.turns.write().await.push(Turn {
            turn_number: 0,
            intents: Vec::new(),
            hash: None,
        });

        // An even 2-2 split: no hash clears a strict majority of the 4
        // active clients, but the Boyer-Moore pick must still be adopted
        // and, since only half of active clients agree with it, every
        // client (including the two that agree) ends up out of sync.
        session.submit_hash(client_ids[0].clone(), 0, 0xAA).await;
        session.submit_hash(client_ids[1].clone(), 0, 0xAA).await;
        session.submit_hash(client_ids[2].clone(), 0, 0xBB).await;
        session.submit_hash(client_ids[3].clone(), 0, 0xBB).await;

        session.run_reconciliation(10).await;

        let stored_hash = session.state.turns.read().await[0].hash;
        assert!(stored_hash.is_some(), "the adopted hash must be written back regardless of majority");

        let out_of_sync = session.state.out_of_sync.read().await.clone();
        assert_eq!(out_of_sync.len(), 4, "half or more out of sync flags every client");

        for handle in &mut handles {
            let event = handle.rx.recv().await.expect("broadcast still open");
            let SessionEvent::Desync { clients_with_correct_hash, total_active_clients, affected, .. } = event
            else {
                panic!("expected a desync event");
            };
            assert_eq!(clients_with_correct_hash, 2);
            assert_eq!(total_active_clients, 4);
            assert_eq!(affected.len(), 4);
        }
    }

    #[test]
    fn send_winner_intent_carries_the_voter_id() {
        let intent = SendWinnerIntent {
            client_id: ClientId("c1".into()),
            winner: WinnerDescriptor::Player { id: ClientId("c1".into()) },
            stats: Default::default(),
        };
        assert_eq!(intent.client_id.0, "c1");
    }
}
