//! Push messages sent over the ranked queue WebSocket.

use serde::{Deserialize, Serialize};

use super::match_info::MatchInfo;
use crate::ApiError;

/// A client message on the ranked queue socket.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RankedClientMessage {
    Enqueue { season_id: String },
    Cancel { ticket_id: String },
    Accept { match_id: String, ticket_id: String, token: String },
    Decline { match_id: String, ticket_id: String },
}

/// A server push on the ranked queue socket.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RankedMessage {
    /// Periodic position/ETA update while queued.
    QueueUpdate {
        position: u32,
        estimated_wait_seconds: u32,
    },
    /// A match has been proposed; the client has until the deadline to
    /// accept or decline. `accept_token` is scoped to the receiving ticket
    /// and must be echoed back in `Accept`.
    MatchFound { info: MatchInfo, accept_token: String },
    /// Every participant accepted; a session is being created.
    MatchReady { info: MatchInfo, session_id: String },
    /// The match was cancelled before becoming ready.
    MatchCancelled { match_id: String, reason: String },
    Error { error: ApiError },
}
