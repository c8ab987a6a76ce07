//! Ranked HTTP/WS routes. Unlike the worker's session-control API, these
//! are never nested under a `/w{worker}/` shard prefix — ranked matchmaking
//! is fleet-wide, not per-session, so every worker answers the same
//! `/ranked/...` paths.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::{Router, routing::{delete, get, post}};

use http::StatusCode;

use serde::{Deserialize, Serialize};

use tracing::instrument;

use turnkeep_model::ranked::{QueueTicket, RankedClientMessage, RankedMessage};

use crate::app::error::{AppError, AppErrorKind};
use crate::app::{AppJson, AppState};
use crate::auth::AuthenticatedClient;
use crate::ranked::coordinator::EnqueueError;
use crate::ranked::repository;

fn enqueue_error(error: EnqueueError) -> AppError {
    match error {
        EnqueueError::Database(error) => AppError::new(AppErrorKind::Database(error)),
        EnqueueError::Penalized { until } => {
            AppError::new(AppErrorKind::Conflict(format!("dodge penalty active until {until}")))
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/queue", post(enqueue))
        .route("/queue/{ticket_id}", get(ticket_status))
        .route("/queue/{ticket_id}", delete(cancel))
        .route("/matches/{match_id}/accept", post(accept))
        .route("/matches/{match_id}/decline", post(decline))
        .route("/stream", get(stream))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub season_id: Option<String>,
}

/// `POST /ranked/queue`.
#[instrument(skip(state))]
async fn enqueue(
    State(state): State<AppState>,
    auth: AuthenticatedClient,
    AppJson(request): AppJson<EnqueueRequest>,
) -> Result<AppJson<QueueTicket>, AppError> {
    let season_id = match request.season_id {
        Some(id) => id,
        None => repository::current_season_id(&state.db)
            .await
            .map_err(AppErrorKind::Database)?,
    };

    let ticket = state
        .ranked
        .enqueue(auth.claims.sub, season_id)
        .await
        .map_err(enqueue_error)?;

    Ok(AppJson(ticket))
}

/// `GET /ranked/queue/{ticket_id}`.
#[instrument(skip(state))]
async fn ticket_status(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    auth: AuthenticatedClient,
) -> Result<AppJson<QueueTicket>, AppError> {
    let ticket = state
        .ranked
        .ticket(&ticket_id)
        .await
        .ok_or_else(|| AppError::new(AppErrorKind::NotFound))?;

    if ticket.persistent_id != auth.claims.sub {
        return Err(AppError::new(AppErrorKind::Forbidden));
    }

    Ok(AppJson(ticket))
}

/// `DELETE /ranked/queue/{ticket_id}`.
#[instrument(skip(state))]
async fn cancel(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    auth: AuthenticatedClient,
) -> Result<AppJson<CancelResponse>, AppError> {
    let ticket = state
        .ranked
        .ticket(&ticket_id)
        .await
        .ok_or_else(|| AppError::new(AppErrorKind::NotFound))?;

    if ticket.persistent_id != auth.claims.sub {
        return Err(AppError::new(AppErrorKind::Forbidden));
    }

    let cancelled = state
        .ranked
        .cancel(&ticket_id)
        .await
        .map_err(AppErrorKind::Database)?;

    Ok(AppJson(CancelResponse { cancelled }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    pub ticket_id: String,
    pub token: String,
}

/// `POST /ranked/matches/{match_id}/accept`.
#[instrument(skip(state))]
async fn accept(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    _auth: AuthenticatedClient,
    AppJson(request): AppJson<AcceptRequest>,
) -> Result<StatusCode, AppError> {
    state
        .ranked
        .accept(&match_id, &request.ticket_id, &request.token)
        .await
        .map_err(AppErrorKind::Database)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct DeclineRequest {
    pub ticket_id: String,
}

/// `POST /ranked/matches/{match_id}/decline`.
#[instrument(skip(state))]
async fn decline(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    _auth: AuthenticatedClient,
    AppJson(request): AppJson<DeclineRequest>,
) -> Result<StatusCode, AppError> {
    state
        .ranked
        .decline(&match_id, &request.ticket_id)
        .await
        .map_err(AppErrorKind::Database)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub ticket_id: Option<String>,
}

/// `GET /ranked/stream`. Pushes [`RankedMessage`]s for the authenticated
/// player (and, once known, their active ticket) and accepts
/// [`RankedClientMessage`]s as a JSON-over-WS alternative to the plain HTTP
/// routes above.
#[instrument(skip(state, ws))]
async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    auth: AuthenticatedClient,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_failed_upgrade(|error| {
        tracing::error!(%error, "failed to upgrade ranked stream websocket");
    })
    .on_upgrade(move |socket| async move {
        serve(socket, state, auth.claims.sub, query.ticket_id).await;
    })
}

async fn serve(
    mut socket: WebSocket,
    state: AppState,
    player_id: turnkeep_model::session::PersistentId,
    ticket_id: Option<String>,
) {
    let mut updates = state.ranked.subscribe(Some(player_id.clone()), ticket_id).await;

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(message) = update else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                let Ok(client_message) = serde_json::from_str::<RankedClientMessage>(&text) else {
                    continue;
                };
                if let Err(error) = handle_client_message(&state, &player_id, client_message).await {
                    tracing::warn!(%error, "ranked stream request failed");
                }
            }
        }
    }
}

async fn handle_client_message(
    state: &AppState,
    player_id: &turnkeep_model::session::PersistentId,
    message: RankedClientMessage,
) -> Result<(), AppError> {
    match message {
        RankedClientMessage::Enqueue { season_id } => {
            state
                .ranked
                .enqueue(player_id.clone(), season_id)
                .await
                .map_err(enqueue_error)?;
        }
        RankedClientMessage::Cancel { ticket_id } => {
            state.ranked.cancel(&ticket_id).await.map_err(AppErrorKind::Database)?;
        }
        RankedClientMessage::Accept { match_id, ticket_id, token } => {
            state
                .ranked
                .accept(&match_id, &ticket_id, &token)
                .await
                .map_err(AppErrorKind::Database)?;
        }
        RankedClientMessage::Decline { match_id, ticket_id } => {
            state
                .ranked
                .decline(&match_id, &ticket_id)
                .await
                .map_err(AppErrorKind::Database)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use sqlx::sqlite::SqlitePoolOptions;

    use crate::archive::InMemoryArchiveSink;
    use crate::auth::human_check::NoopHumanCheck;
    use crate::auth::jwt::JwtVerifier;
    use crate::auth::roles::NoopRoleProvider;
    use crate::config::{AuthConfig, MatchmakingConfig, MmrConfig, RateLimitConfig};
    use crate::manager::SessionManager;
    use crate::ranked::RankedCoordinator;
    use crate::rate_limit::RateLimiter;

    async fn test_state() -> AppState {
        let db = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite connects");
        sqlx::migrate!("./migrations").run(&db).await.expect("migrations apply");

        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemoryArchiveSink::new()),
            std::time::Duration::from_secs(1),
        ));
        let ranked = Arc::new(RankedCoordinator::new(
            db.clone(),
            Arc::clone(&sessions),
            MatchmakingConfig::default(),
            MmrConfig::default(),
            0,
            1,
        ));

        let auth = AuthConfig { jwt_secret: Some("test-secret".into()), ..AuthConfig::default() };
        let jwt = Arc::new(JwtVerifier::new(&auth).expect("jwt verifier builds with a secret"));

        AppState {
            db,
            worker_id: 0,
            num_workers: 1,
            sessions,
            ranked,
            jwt,
            roles: Arc::new(NoopRoleProvider),
            auth: Arc::new(auth),
            archive: Arc::new(InMemoryArchiveSink::new()),
            rate_limiter: Arc::new(RateLimiter::new(&RateLimitConfig::default())),
            human_check: Arc::new(NoopHumanCheck),
        }
    }

    #[tokio::test]
    async fn enqueue_message_joins_the_player_to_the_queue() {
        let state = test_state().await;
        let player = turnkeep_model::session::PersistentId("alice".into());

        handle_client_message(
            &state,
            &player,
            RankedClientMessage::Enqueue { season_id: "season-1".into() },
        )
        .await
        .expect("enqueue succeeds");

        let queued = repository::load_queued_tickets(&state.db).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].persistent_id, player);
    }

    #[tokio::test]
    async fn cancel_message_removes_an_existing_ticket() {
        let state = test_state().await;
        let player = turnkeep_model::session::PersistentId("alice".into());

        let ticket = state.ranked.enqueue(player.clone(), "season-1".into()).await.unwrap();

        handle_client_message(&state, &player, RankedClientMessage::Cancel { ticket_id: ticket.id.clone() })
            .await
            .expect("cancel succeeds");

        assert!(repository::load_queued_tickets(&state.db).await.unwrap().is_empty());
        let cancelled = state.ranked.ticket(&ticket.id).await.expect("ticket still tracked");
        assert_eq!(cancelled.state, turnkeep_model::ranked::TicketState::Cancelled);
    }

    #[tokio::test]
    async fn accept_message_with_an_unknown_match_id_is_a_harmless_no_op() {
        let state = test_state().await;
        let player = turnkeep_model::session::PersistentId("alice".into());

        let outcome = handle_client_message(
            &state,
            &player,
            RankedClientMessage::Accept {
                match_id: "no-such-match".into(),
                ticket_id: "no-such-ticket".into(),
                token: "bogus".into(),
            },
        )
        .await;

        assert!(outcome.is_ok());
    }
}
