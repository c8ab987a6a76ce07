//! A matchmaking queue ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::PersistentId;

/// Where a ticket sits in the matchmaking lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// Waiting in a queue bucket for a compatible opponent pool.
    Queued,
    /// Paired into a [`super::match_info::MatchInfo`]; awaiting every
    /// participant's accept.
    Matched,
    /// Every participant accepted; a session is being created.
    Ready,
    /// Withdrawn by the player, timed out, or dropped for a dodge.
    Cancelled,
    /// The session this ticket fed into has concluded.
    Completed,
}

/// A player's standing request for a ranked opponent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueueTicket {
    pub id: String,
    pub persistent_id: PersistentId,
    pub season_id: String,
    /// The player's rating at the moment of enqueue; the matchmaking window
    /// widens against this snapshot, not a live-refreshed value.
    pub rating_snapshot: f64,
    pub queued_at: DateTime<Utc>,
    pub state: TicketState,
    /// Set once this ticket has been paired into a match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
}
