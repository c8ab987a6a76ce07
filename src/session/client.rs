//! Server-internal bookkeeping for one seat in a session's roster.
//!
//! Distinct from the wire-level `RosterEntry`: this carries liveness state
//! the protocol never serializes.

use std::net::IpAddr;

use chrono::{DateTime, Utc};

use turnkeep_model::session::{ClientId, PersistentId, RosterEntry, TeamId};

#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub client_id: ClientId,
    pub persistent_id: PersistentId,
    pub display_name: String,
    pub team: Option<TeamId>,
    pub ip: IpAddr,
    /// Last transport-level ping, independent of the 1s/10-turn simulation
    /// cadence; the liveness sweep compares this against the disconnect and
    /// eviction thresholds.
    pub last_ping: DateTime<Utc>,
    /// `None` while connected; set to the moment the stream dropped once
    /// disconnected, so the manager's eviction sweep can compare against
    /// the configured eviction timeout.
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_seen_turn: u64,
}

impl ClientHandle {
    pub fn new(
        client_id: ClientId,
        persistent_id: PersistentId,
        display_name: String,
        team: Option<TeamId>,
        ip: IpAddr,
    ) -> ClientHandle {
        ClientHandle {
            client_id,
            persistent_id,
            display_name,
            team,
            ip,
            last_ping: Utc::now(),
            disconnected_at: None,
            last_seen_turn: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    pub fn to_roster_entry(&self) -> RosterEntry {
        RosterEntry {
            client_id: self.client_id.clone(),
            persistent_id: self.persistent_id.clone(),
            display_name: self.display_name.clone(),
            team: self.team.clone(),
            cosmetics: Default::default(),
        }
    }
}
