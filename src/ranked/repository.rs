//! The Repository collaborator: sqlx persistence for seasons, ratings,
//! queue tickets, matches, and the dodge-penalty ledger.
//!
//! Shaped after `player::upsert_player` and `player::mmr`'s query style:
//! runtime-checked `query`/`query_as` against local row DTOs, never the
//! compile-time `query!` macros (no `DATABASE_URL` needed to build this
//! crate).

use chrono::{DateTime, TimeDelta, Utc};

use sqlx::{FromRow, SqlitePool};

use turnkeep_model::ranked::{MatchInfo, MatchState, PlayerRating, QueueTicket, TicketState};
use turnkeep_model::session::PersistentId;

use crate::config::PlayerRatingDefaults;

#[derive(FromRow)]
struct PlayerRatingRow {
    persistent_id: String,
    season_id: String,
    rating: f64,
    deviation: f64,
    volatility: f64,
    updated_at: DateTime<Utc>,
}

impl From<PlayerRatingRow> for PlayerRating {
    fn from(row: PlayerRatingRow) -> PlayerRating {
        PlayerRating {
            persistent_id: PersistentId(row.persistent_id),
            season_id: row.season_id,
            rating: row.rating,
            deviation: row.deviation,
            volatility: row.volatility,
            updated_at: row.updated_at,
        }
    }
}

/// Fetches the most recently started season, creating a default one if
/// none has ever been registered.
pub async fn current_season_id(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let existing = sqlx::query_scalar::<_, String>(
        "SELECT id FROM season ORDER BY started_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id = "season-1".to_string();
    sqlx::query("INSERT INTO season (id, started_at) VALUES ($1, $2)")
        .bind(&id)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(id)
}

pub async fn get_rating(
    pool: &SqlitePool,
    persistent_id: &PersistentId,
    season_id: &str,
) -> Result<Option<PlayerRating>, sqlx::Error> {
    sqlx::query_as::<_, PlayerRatingRow>(
        "SELECT persistent_id, season_id, rating, deviation, volatility, updated_at
         FROM player_rating WHERE persistent_id = $1 AND season_id = $2",
    )
    .bind(persistent_id.as_str())
    .bind(season_id)
    .fetch_optional(pool)
    .await
    .map(|row| row.map(Into::into))
}

pub async fn get_or_init_rating(
    pool: &SqlitePool,
    persistent_id: &PersistentId,
    season_id: &str,
    defaults: &PlayerRatingDefaults,
) -> Result<PlayerRating, sqlx::Error> {
    if let Some(rating) = get_rating(pool, persistent_id, season_id).await? {
        return Ok(rating);
    }

    let rating = PlayerRating {
        persistent_id: persistent_id.clone(),
        season_id: season_id.to_string(),
        rating: defaults.rating,
        deviation: defaults.deviation,
        volatility: defaults.volatility,
        updated_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO player_rating
            (persistent_id, season_id, rating, deviation, volatility, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (persistent_id, season_id) DO NOTHING",
    )
    .bind(rating.persistent_id.as_str())
    .bind(&rating.season_id)
    .bind(rating.rating)
    .bind(rating.deviation)
    .bind(rating.volatility)
    .bind(rating.updated_at)
    .execute(pool)
    .await?;

    Ok(rating)
}

/// Every rated player in a season, highest rating first, for the
/// leaderboard dump.
pub async fn list_ratings(pool: &SqlitePool, season_id: &str) -> Result<Vec<PlayerRating>, sqlx::Error> {
    sqlx::query_as::<_, PlayerRatingRow>(
        "SELECT persistent_id, season_id, rating, deviation, volatility, updated_at
         FROM player_rating WHERE season_id = $1 ORDER BY rating DESC",
    )
    .bind(season_id)
    .fetch_all(pool)
    .await
    .map(|rows| rows.into_iter().map(Into::into).collect())
}

/// Stores a player's post-match rating and its audit row, inside one
/// transaction so the two never disagree.
pub async fn save_rating_update(
    pool: &SqlitePool,
    match_id: &str,
    before: &PlayerRating,
    after: &PlayerRating,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE player_rating
         SET rating = $3, deviation = $4, volatility = $5, updated_at = $6
         WHERE persistent_id = $1 AND season_id = $2",
    )
    .bind(after.persistent_id.as_str())
    .bind(&after.season_id)
    .bind(after.rating)
    .bind(after.deviation)
    .bind(after.volatility)
    .bind(after.updated_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO rating_history
            (persistent_id, match_id, season_id, rating_before, deviation_before,
             rating_after, deviation_after, recorded_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(after.persistent_id.as_str())
    .bind(match_id)
    .bind(&after.season_id)
    .bind(before.rating)
    .bind(before.deviation)
    .bind(after.rating)
    .bind(after.deviation)
    .bind(after.updated_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

#[derive(FromRow)]
struct QueueTicketRow {
    id: String,
    persistent_id: String,
    season_id: String,
    rating_snapshot: f64,
    queued_at: DateTime<Utc>,
    state: String,
    match_id: Option<String>,
}

fn ticket_state_name(state: TicketState) -> &'static str {
    match state {
        TicketState::Queued => "queued",
        TicketState::Matched => "matched",
        TicketState::Ready => "ready",
        TicketState::Cancelled => "cancelled",
        TicketState::Completed => "completed",
    }
}

fn parse_ticket_state(name: &str) -> TicketState {
    match name {
        "matched" => TicketState::Matched,
        "ready" => TicketState::Ready,
        "cancelled" => TicketState::Cancelled,
        "completed" => TicketState::Completed,
        _ => TicketState::Queued,
    }
}

impl From<QueueTicketRow> for QueueTicket {
    fn from(row: QueueTicketRow) -> QueueTicket {
        QueueTicket {
            id: row.id,
            persistent_id: PersistentId(row.persistent_id),
            season_id: row.season_id,
            rating_snapshot: row.rating_snapshot,
            queued_at: row.queued_at,
            state: parse_ticket_state(&row.state),
            match_id: row.match_id,
        }
    }
}

pub async fn save_ticket(pool: &SqlitePool, ticket: &QueueTicket) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO queue_ticket
            (id, persistent_id, season_id, rating_snapshot, queued_at, state, match_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (id) DO UPDATE SET
            state = excluded.state,
            match_id = excluded.match_id,
            queued_at = excluded.queued_at",
    )
    .bind(&ticket.id)
    .bind(ticket.persistent_id.as_str())
    .bind(&ticket.season_id)
    .bind(ticket.rating_snapshot)
    .bind(ticket.queued_at)
    .bind(ticket_state_name(ticket.state))
    .bind(&ticket.match_id)
    .execute(pool)
    .await
    .map(|_| ())
}

pub async fn delete_ticket(pool: &SqlitePool, ticket_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM queue_ticket WHERE id = $1")
        .bind(ticket_id)
        .execute(pool)
        .await
        .map(|_| ())
}

/// Every ticket still `queued`, ordered by join time, for startup rehydration.
pub async fn load_queued_tickets(pool: &SqlitePool) -> Result<Vec<QueueTicket>, sqlx::Error> {
    sqlx::query_as::<_, QueueTicketRow>(
        "SELECT id, persistent_id, season_id, rating_snapshot, queued_at, state, match_id
         FROM queue_ticket WHERE state = 'queued' ORDER BY queued_at ASC",
    )
    .fetch_all(pool)
    .await
    .map(|rows| rows.into_iter().map(Into::into).collect())
}

#[derive(FromRow)]
struct MatchInfoRow {
    id: String,
    season_id: String,
    participants: String,
    state: String,
    created_at: DateTime<Utc>,
    accept_deadline: DateTime<Utc>,
    session_id: Option<String>,
}

fn match_state_name(state: MatchState) -> &'static str {
    match state {
        MatchState::AwaitingAccept => "awaiting_accept",
        MatchState::Ready => "ready",
        MatchState::Cancelled => "cancelled",
        MatchState::Completed => "completed",
    }
}

fn parse_match_state(name: &str) -> MatchState {
    match name {
        "ready" => MatchState::Ready,
        "cancelled" => MatchState::Cancelled,
        "completed" => MatchState::Completed,
        _ => MatchState::AwaitingAccept,
    }
}

impl TryFrom<MatchInfoRow> for MatchInfo {
    type Error = sqlx::Error;

    fn try_from(row: MatchInfoRow) -> Result<MatchInfo, sqlx::Error> {
        let participants = serde_json::from_str::<Vec<String>>(&row.participants)
            .map_err(|error| sqlx::Error::Decode(Box::new(error)))?
            .into_iter()
            .map(PersistentId)
            .collect();

        Ok(MatchInfo {
            id: row.id,
            season_id: row.season_id,
            participants,
            state: parse_match_state(&row.state),
            created_at: row.created_at,
            accept_deadline: row.accept_deadline,
            session_id: row.session_id,
        })
    }
}

pub async fn save_match(pool: &SqlitePool, info: &MatchInfo) -> Result<(), sqlx::Error> {
    let participants = serde_json::to_string(
        &info.participants.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
    )
    .expect("participant ids serialize infallibly");

    sqlx::query(
        "INSERT INTO match_info
            (id, season_id, participants, state, created_at, accept_deadline, session_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (id) DO UPDATE SET
            state = excluded.state,
            session_id = excluded.session_id",
    )
    .bind(&info.id)
    .bind(&info.season_id)
    .bind(participants)
    .bind(match_state_name(info.state))
    .bind(info.created_at)
    .bind(info.accept_deadline)
    .bind(&info.session_id)
    .execute(pool)
    .await
    .map(|_| ())
}

/// Inserts one row per participant, unrated, idempotently.
pub async fn save_participants(
    pool: &SqlitePool,
    match_id: &str,
    participants: &[PersistentId],
) -> Result<(), sqlx::Error> {
    for persistent_id in participants {
        sqlx::query(
            "INSERT INTO match_participant (match_id, persistent_id, rating_after)
             VALUES ($1, $2, NULL)
             ON CONFLICT (match_id, persistent_id) DO NOTHING",
        )
        .bind(match_id)
        .bind(persistent_id.as_str())
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Whether this `(matchId, playerId)` pair has not yet had a rating
/// applied. Checked before rating, per §4.6's idempotence requirement.
pub async fn participant_needs_rating(
    pool: &SqlitePool,
    match_id: &str,
    persistent_id: &PersistentId,
) -> Result<bool, sqlx::Error> {
    let rating_after = sqlx::query_scalar::<_, Option<f64>>(
        "SELECT rating_after FROM match_participant WHERE match_id = $1 AND persistent_id = $2",
    )
    .bind(match_id)
    .bind(persistent_id.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(matches!(rating_after, Some(None) | None))
}

pub async fn mark_participant_rated(
    pool: &SqlitePool,
    match_id: &str,
    persistent_id: &PersistentId,
    rating_after: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE match_participant SET rating_after = $3
         WHERE match_id = $1 AND persistent_id = $2",
    )
    .bind(match_id)
    .bind(persistent_id.as_str())
    .bind(rating_after)
    .execute(pool)
    .await
    .map(|_| ())
}

#[derive(Clone, Debug, FromRow)]
pub struct DodgeRecord {
    pub count: i64,
    pub last_dodge_at: DateTime<Utc>,
    pub penalty_until: Option<DateTime<Utc>>,
}

pub async fn get_dodge_record(
    pool: &SqlitePool,
    persistent_id: &PersistentId,
) -> Result<Option<DodgeRecord>, sqlx::Error> {
    sqlx::query_as::<_, DodgeRecord>(
        "SELECT count, last_dodge_at, penalty_until
         FROM player_dodge WHERE persistent_id = $1",
    )
    .bind(persistent_id.as_str())
    .fetch_optional(pool)
    .await
}

/// Records one dodge incident, escalating the penalty window per
/// `dodge_penalty_seconds`, resetting the count if more than 24h has
/// passed since the last incident.
pub async fn record_dodge(
    pool: &SqlitePool,
    persistent_id: &PersistentId,
    escalator: &[u32],
) -> Result<DateTime<Utc>, sqlx::Error> {
    let now = Utc::now();
    let existing = get_dodge_record(pool, persistent_id).await?;

    let count: i64 = match existing {
        Some(record) if now - record.last_dodge_at <= TimeDelta::hours(24) => record.count + 1,
        _ => 1,
    };

    let index = (count as usize).saturating_sub(1).min(escalator.len().saturating_sub(1));
    let penalty_seconds = escalator.get(index).copied().unwrap_or(0);
    let penalty_until = now + TimeDelta::seconds(i64::from(penalty_seconds));

    sqlx::query(
        "INSERT INTO player_dodge (persistent_id, count, last_dodge_at, penalty_until)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (persistent_id) DO UPDATE SET
            count = excluded.count,
            last_dodge_at = excluded.last_dodge_at,
            penalty_until = excluded.penalty_until",
    )
    .bind(persistent_id.as_str())
    .bind(count)
    .bind(now)
    .bind(penalty_until)
    .execute(pool)
    .await?;

    Ok(penalty_until)
}

/// Deletes dodge ledger entries whose last incident is stale, per the
/// housekeeping sweep.
pub async fn prune_stale_dodges(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let cutoff = Utc::now() - TimeDelta::hours(24);
    sqlx::query("DELETE FROM player_dodge WHERE last_dodge_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .map(|_| ())
}
