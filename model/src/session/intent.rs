//! The tagged `Intent` union carried inside every [`super::turn::Turn`].
//!
//! The session engine is deliberately ignorant of game rules: most intent
//! kinds are opaque payloads it stamps with a turn number and rebroadcasts
//! without inspection. A small number of control intents — `update-config`,
//! `toggle-pause`, `kick-player`, `mark-disconnected`, `send-winner` — are
//! interpreted by the engine itself, so they carry typed fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::SessionConfigPatch;
use super::ClientId;

/// A game-content payload the session engine does not interpret. Carried
/// verbatim from the originating client to every other client in the
/// session's next turn.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OpaqueIntent {
    pub client_id: ClientId,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KickPlayerIntent {
    pub client_id: ClientId,
    pub target: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdateConfigIntent {
    pub client_id: ClientId,
    pub patch: SessionConfigPatch,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TogglePauseIntent {
    pub client_id: ClientId,
    pub paused: bool,
}

/// Synthesized by the session engine, not by a client, when a client's
/// liveness state changes. Still queued into the turn stream like any other
/// intent so every connected client observes it at the same turn number.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarkDisconnectedIntent {
    pub client_id: ClientId,
    pub disconnected: bool,
}

/// A vote for how the match ended. Recorded by [`super::super::ranked`]
/// reconciliation; see [`WinnerDescriptor`] for the canonical-key rule.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SendWinnerIntent {
    pub client_id: ClientId,
    pub winner: WinnerDescriptor,
    #[serde(default)]
    pub stats: BTreeMap<String, serde_json::Value>,
}

/// Who won, as voted by a `send-winner` intent.
///
/// Field order here is the wire order: a team vote lists members in the
/// order the voting client chose (first member is the one credited if the
/// reward is unweighted), and two votes for the same outcome must serialize
/// identically to be counted as the same vote. [`WinnerDescriptor::vote_key`]
/// is the canonical byte-for-byte comparison key.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WinnerDescriptor {
    Player { id: ClientId },
    Team { team: String, member_ids: Vec<ClientId> },
}

impl WinnerDescriptor {
    /// A canonical string safe to use as a `HashMap` key for majority-vote
    /// tallying. Two votes compare equal under this key iff they would
    /// serialize to the same JSON.
    pub fn vote_key(&self) -> String {
        serde_json::to_string(self).expect("WinnerDescriptor serializes infallibly")
    }
}

/// One entry in a turn's intent list.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Intent {
    Movement(OpaqueIntent),
    Build(OpaqueIntent),
    Chat(OpaqueIntent),
    Emoji(OpaqueIntent),
    Embargo(OpaqueIntent),
    AllianceRequest(OpaqueIntent),
    AllianceReply(OpaqueIntent),
    AllianceBreak(OpaqueIntent),
    AllianceExtend(OpaqueIntent),
    Donate(OpaqueIntent),
    Attack(OpaqueIntent),
    Cancel(OpaqueIntent),
    Target(OpaqueIntent),
    KickPlayer(KickPlayerIntent),
    UpdateConfig(UpdateConfigIntent),
    TogglePause(TogglePauseIntent),
    MarkDisconnected(MarkDisconnectedIntent),
    SendWinner(SendWinnerIntent),
    /// A tag this build doesn't recognize. Kept (rather than failing to
    /// deserialize the whole turn) so one forward-incompatible client can't
    /// take a whole session down; the engine logs and drops these.
    #[serde(other)]
    Unknown,
}

impl Intent {
    /// The client the intent is attributed to, when known. `Unknown`
    /// carries no fields to attribute.
    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Intent::Movement(i)
            | Intent::Build(i)
            | Intent::Chat(i)
            | Intent::Emoji(i)
            | Intent::Embargo(i)
            | Intent::AllianceRequest(i)
            | Intent::AllianceReply(i)
            | Intent::AllianceBreak(i)
            | Intent::AllianceExtend(i)
            | Intent::Donate(i)
            | Intent::Attack(i)
            | Intent::Cancel(i)
            | Intent::Target(i) => Some(&i.client_id),
            Intent::KickPlayer(i) => Some(&i.client_id),
            Intent::UpdateConfig(i) => Some(&i.client_id),
            Intent::TogglePause(i) => Some(&i.client_id),
            Intent::MarkDisconnected(i) => Some(&i.client_id),
            Intent::SendWinner(i) => Some(&i.client_id),
            Intent::Unknown => None,
        }
    }
}
