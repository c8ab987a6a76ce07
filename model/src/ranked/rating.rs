//! Glicko-2 rating DTOs, as read from and written to the repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::PersistentId;

/// A player's current rating within one season.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlayerRating {
    pub persistent_id: PersistentId,
    pub season_id: String,
    pub rating: f64,
    pub deviation: f64,
    pub volatility: f64,
    pub updated_at: DateTime<Utc>,
}

/// One rating change applied at match conclusion, kept for audit and for
/// the public leaderboard's "recent form" display.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RatingHistoryEntry {
    pub persistent_id: PersistentId,
    pub match_id: String,
    pub season_id: String,
    pub rating_before: f64,
    pub deviation_before: f64,
    pub rating_after: f64,
    pub deviation_after: f64,
    pub recorded_at: DateTime<Utc>,
}
