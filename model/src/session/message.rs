//! WebSocket message envelopes for the session protocol.
//!
//! Split into [`ClientMessage`] (inbound) and [`ServerMessage`] (outbound),
//! each a `#[serde(tag = "type")]` union, in the shape the teacher repo's
//! `room` module used for its own WS protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::intent::{Intent, WinnerDescriptor};
use super::turn::Turn;
use super::{GameStartInfo, PersistentId, SessionInfo};
use crate::ApiError;

/// A message sent by a connected client.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a fresh connection: mint a new [`super::ClientId`]
    /// and enter the lobby roster.
    Join {
        persistent_id: PersistentId,
        display_name: String,
        #[serde(default)]
        cosmetics: BTreeMap<String, serde_json::Value>,
        /// The last turn this client has already observed; `0` for a
        /// brand-new client. Everything from here onward is replayed in the
        /// `start` message once the session has begun.
        #[serde(default)]
        last_seen_turn: u64,
        /// Bearer token proving the external identity, verified against the
        /// configured issuer; absent for anonymous/practice sessions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Proof-of-humanity token from the configured challenge provider;
        /// checked once per fresh join, never on a reconnect.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turnstile_token: Option<String>,
    },
    /// First message on a reconnect: resume an existing `PersistentId`'s
    /// seat, picking the turn stream back up from `last_seen_turn`.
    Rejoin {
        persistent_id: PersistentId,
        last_seen_turn: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Transport-level liveness probe, independent of the simulation
    /// liveness sweep.
    Ping { seq: u64 },
    /// Submit one intent for inclusion in the next turn.
    Intent { intent: Intent },
    /// Report the locally-computed hash of a turn's resulting state, used
    /// for desync detection.
    Hash { turn_number: u64, hash: u64 },
    /// Vote for how the match concluded.
    Winner {
        winner: WinnerDescriptor,
        #[serde(default)]
        stats: BTreeMap<String, serde_json::Value>,
    },
}

/// A message pushed to a connected client.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a `ping`, transport-level liveness only.
    Pong { seq: u64 },
    /// Sent once, immediately after a successful `join`/`rejoin`.
    LobbyInfo { info: SessionInfo },
    /// Entering the prestart countdown; `Start()` follows in
    /// `seconds_remaining` seconds barring a config change that resets it.
    Prestart { seconds_remaining: u32 },
    /// The session has started; roster and config are now frozen. `turns`
    /// replays everything from the joiner's requested `last_seen_turn`
    /// onward so a late joiner (or a reconnect) catches up in one message.
    Start {
        info: GameStartInfo,
        turns: Vec<Turn>,
    },
    /// The next turn in the stream.
    Turn { turn: Turn },
    /// A minority of reported hashes diverged from the majority for the
    /// named turn. Sent only to clients whose hash did not match.
    Desync {
        turn_number: u64,
        correct_hash: u64,
        clients_with_correct_hash: u32,
        total_active_clients: u32,
    },
    /// A client-visible error; the connection is closed immediately after.
    Error { error: ApiError },
}
