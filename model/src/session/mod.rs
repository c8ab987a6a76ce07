//! Session (game) protocol wire types.

pub mod config;
pub mod intent;
pub mod message;
pub mod turn;

pub use config::{GameDifficulty, GameMode, GameType, MapSize, SessionConfig, SessionConfigPatch};
pub use intent::{Intent, WinnerDescriptor};
pub use message::{ClientMessage, ServerMessage};
pub use turn::Turn;

use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stable identifier for one connected stream within a session.
///
/// Unlike [`PersistentId`], a new `ClientId` is minted for every stream, even
/// a reconnect of the same human player.
#[derive(Clone, Debug, Deref, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct ClientId(pub String);

/// A stable identifier that survives reconnects.
///
/// Exactly one [`ClientId`] holds a given `PersistentId` at any moment within
/// a session.
#[derive(Clone, Debug, Deref, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct PersistentId(pub String);

/// A team label, as assigned in [`SessionConfig::team_assignments`].
#[derive(Clone, Debug, Deref, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct TeamId(pub String);

/// Publicly-visible summary of a session, used for lobby listings and the
/// `GET /api/game/:id` info endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub config: SessionConfig,
    pub num_clients: u32,
    pub max_players: Option<u32>,
    pub has_started: bool,
    pub has_ended: bool,
}

/// A roster entry frozen into [`GameStartInfo`] at `Start()`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RosterEntry {
    pub client_id: ClientId,
    pub persistent_id: PersistentId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamId>,
    #[serde(default)]
    pub cosmetics: BTreeMap<String, serde_json::Value>,
}

/// The frozen roster + config handed to clients in the `start` message.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GameStartInfo {
    pub config: SessionConfig,
    pub roster: Vec<RosterEntry>,
}
