//! `SessionConfig`: the lobby settings that travel with a session from
//! creation through `Start()`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{PersistentId, TeamId};

/// Map size, in the coarse buckets the matchmaker reasons about.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum MapSize {
    Small = 0,
    Medium = 1,
    Large = 2,
    ExtraLarge = 3,
}

/// Bot difficulty, applied uniformly to every AI-controlled slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum GameDifficulty {
    Easy = 0,
    Medium = 1,
    Hard = 2,
    Impossible = 3,
}

/// Team structure for the match.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameMode {
    FreeForAll,
    Teams { team_count: u8 },
}

/// Who may join a session and how it is discovered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum GameType {
    /// Listed in the public lobby browser.
    Public = 0,
    /// Joinable only by session id.
    Private = 1,
    /// A single-human practice session; never matched competitively.
    Single = 2,
}

/// Toggles that change simulation rules without changing the protocol.
///
/// These are opaque to the session engine: it neither interprets nor
/// validates them beyond carrying them to every client at `Start()` and
/// accepting patches to them via the `update-config` intent while the
/// session is still in its lobby phase.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameToggles {
    #[serde(default)]
    pub infinite_gold: bool,
    #[serde(default)]
    pub donate_gold: bool,
    #[serde(default)]
    pub donate_troops: bool,
    #[serde(default)]
    pub instant_build: bool,
    #[serde(default)]
    pub random_spawns: bool,
}

/// The full set of choices a lobby creator (or the ranked coordinator, for a
/// synthesized match) makes before a session starts.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_map")]
    pub map: String,
    #[serde(default = "SessionConfig::default_map_size")]
    pub map_size: MapSize,
    #[serde(default = "SessionConfig::default_difficulty")]
    pub difficulty: GameDifficulty,
    #[serde(default = "SessionConfig::default_mode")]
    pub mode: GameMode,
    #[serde(default = "SessionConfig::default_game_type")]
    pub game_type: GameType,
    #[serde(default)]
    pub bot_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub disabled_units: BTreeSet<String>,
    #[serde(default)]
    pub team_assignments: BTreeMap<PersistentId, TeamId>,
    #[serde(default)]
    pub toggles: GameToggles,
    /// Seconds to linger in `Prestart` before `Start()`; `None` uses the
    /// session manager's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prestart_seconds: Option<u32>,
    /// Seconds of spawn immunity after `Start()`; `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_immunity_seconds: Option<u32>,
    /// When set, only these external identities may join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<BTreeSet<String>>,
    /// When set, joining requires holding one of these role ids, as
    /// resolved through the role-provider collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_roles: Option<BTreeSet<String>>,
}

/// A partial patch to a [`SessionConfig`], as carried by the `update-config`
/// intent. Every field is optional; absent fields are left unchanged.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_size: Option<MapSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<GameDifficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GameMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_units: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggles: Option<GameToggles>,
}

impl SessionConfig {
    fn default_map() -> String {
        "random".into()
    }

    fn default_map_size() -> MapSize {
        MapSize::Medium
    }

    fn default_difficulty() -> GameDifficulty {
        GameDifficulty::Medium
    }

    fn default_mode() -> GameMode {
        GameMode::FreeForAll
    }

    fn default_game_type() -> GameType {
        GameType::Private
    }

    /// Applies a patch in place. Called only while the session is still in
    /// its lobby phase; the session engine rejects patches once `Start()`
    /// has run.
    pub fn apply_patch(&mut self, patch: SessionConfigPatch) {
        if let Some(map) = patch.map {
            self.map = map;
        }
        if let Some(map_size) = patch.map_size {
            self.map_size = map_size;
        }
        if let Some(difficulty) = patch.difficulty {
            self.difficulty = difficulty;
        }
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(bot_count) = patch.bot_count {
            self.bot_count = bot_count;
        }
        if let Some(max_players) = patch.max_players {
            self.max_players = Some(max_players);
        }
        if let Some(disabled_units) = patch.disabled_units {
            self.disabled_units = disabled_units;
        }
        if let Some(toggles) = patch.toggles {
            self.toggles = toggles;
        }
    }
}
