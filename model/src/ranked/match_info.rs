//! A proposed (or confirmed) ranked match.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::PersistentId;

/// Where a proposed match sits in the accept lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    /// Proposed to every participant; waiting on accepts within the
    /// configured window.
    AwaitingAccept,
    /// Every participant accepted in time; a session has been (or is being)
    /// created.
    Ready,
    /// At least one participant declined or dodged; the match is dead and
    /// its still-accepted participants are requeued.
    Cancelled,
    /// The resulting session has concluded and ratings have been applied.
    Completed,
}

/// A proposed pairing of players into a ranked session.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MatchInfo {
    pub id: String,
    pub season_id: String,
    pub participants: Vec<PersistentId>,
    pub state: MatchState,
    pub created_at: DateTime<Utc>,
    pub accept_deadline: DateTime<Utc>,
    /// Set once `Ready`, when the worker that will host the game session is
    /// known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
