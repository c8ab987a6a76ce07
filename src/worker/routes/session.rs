//! Session-control HTTP routes (`SPEC_FULL.md` §6), nested under this
//! worker's `/w{worker}/` prefix.

use axum::extract::{FromRef, FromRequestParts, Path, State};

use http::{StatusCode, request::Parts};

use serde::{Deserialize, Serialize};

use tracing::instrument;

use turnkeep_model::session::{ClientId, GameType, PersistentId, SessionInfo};

use crate::app::error::{AppError, AppErrorKind};
use crate::app::{AppJson, AppState};
use crate::auth::AuthenticatedClient;
use crate::auth::admin::AdminAuth;
use crate::shard;

/// Either a bearer-authenticated player (for a private lobby) or the admin
/// header (for a public lobby), matching §6's "Bearer token (creator) or
/// admin header for public".
pub enum CreateGameAuth {
    Player(AuthenticatedClient),
    Admin(AdminAuth),
}

impl<S> FromRequestParts<S> for CreateGameAuth
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Ok(client) = AuthenticatedClient::from_request_parts(parts, state).await {
            return Ok(CreateGameAuth::Player(client));
        }
        AdminAuth::from_request_parts(parts, state)
            .await
            .map(CreateGameAuth::Admin)
    }
}

/// `POST /w{worker}/api/create_game/:id`.
#[instrument(skip(state, body))]
pub async fn create_game(
    State(state): State<AppState>,
    Path((_worker, id)): Path<(u32, String)>,
    auth: CreateGameAuth,
    body: axum::body::Bytes,
) -> Result<(StatusCode, AppJson<SessionInfo>), AppError> {
    if shard::worker_for(&id, state.num_workers) != state.worker_id {
        return Err(AppError::new(AppErrorKind::WrongShard));
    }
    if state.sessions.exists(&id).await {
        return Err(AppError::with_message(
            AppErrorKind::Conflict("session already exists".into()),
            "session already exists",
        ));
    }

    let trimmed: &[u8] = if body.is_empty() { b"{}" } else { body.as_ref() };
    let config: turnkeep_model::session::SessionConfig = serde_json::from_slice(trimmed)
        .map_err(|error| AppError::new(AppErrorKind::BadRequest(error.to_string())))?;

    let creator = match auth {
        CreateGameAuth::Player(client) => {
            if config.game_type == GameType::Public {
                return Err(AppError::new(AppErrorKind::Forbidden));
            }
            client.claims.sub
        }
        CreateGameAuth::Admin(_) => PersistentId("admin".into()),
    };

    let session = state.sessions.create(id, config, creator).await;
    Ok((StatusCode::OK, AppJson(session.info().await)))
}

/// `POST /w{worker}/api/start_game/:id`.
#[instrument(skip(state))]
pub async fn start_game(
    State(state): State<AppState>,
    Path((_worker, id)): Path<(u32, String)>,
    auth: AuthenticatedClient,
) -> Result<AppJson<StartGameResponse>, AppError> {
    let session = state
        .sessions
        .lookup(&id)
        .await
        .ok_or_else(|| AppError::new(AppErrorKind::NotFound))?;

    if !session.is_creator(&auth.claims.sub).await {
        return Err(AppError::new(AppErrorKind::Forbidden));
    }

    session.request_start().await;
    Ok(AppJson(StartGameResponse { success: true }))
}

#[derive(Debug, Serialize)]
pub struct StartGameResponse {
    pub success: bool,
}

/// `PUT /w{worker}/api/game/:id`.
#[instrument(skip(state, patch))]
pub async fn update_game(
    State(state): State<AppState>,
    Path((_worker, id)): Path<(u32, String)>,
    auth: AuthenticatedClient,
    AppJson(patch): AppJson<turnkeep_model::session::SessionConfigPatch>,
) -> Result<AppJson<SessionInfo>, AppError> {
    let session = state
        .sessions
        .lookup(&id)
        .await
        .ok_or_else(|| AppError::new(AppErrorKind::NotFound))?;

    let info = session
        .update_config(&auth.claims.sub, patch)
        .await
        .map_err(|error| match error {
            crate::session::UpdateConfigError::InvalidState => {
                AppError::new(AppErrorKind::InvalidState)
            }
            crate::session::UpdateConfigError::Forbidden => AppError::new(AppErrorKind::Forbidden),
        })?;

    Ok(AppJson(info))
}

/// `GET /w{worker}/api/game/:id/exists`.
#[instrument(skip(state))]
pub async fn game_exists(
    State(state): State<AppState>,
    Path((_worker, id)): Path<(u32, String)>,
) -> AppJson<ExistsResponse> {
    AppJson(ExistsResponse {
        exists: state.sessions.exists(&id).await,
    })
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

/// `GET /w{worker}/api/game/:id`.
#[instrument(skip(state))]
pub async fn game_info(
    State(state): State<AppState>,
    Path((_worker, id)): Path<(u32, String)>,
) -> Result<AppJson<SessionInfo>, AppError> {
    let session = state
        .sessions
        .lookup(&id)
        .await
        .ok_or_else(|| AppError::new(AppErrorKind::NotFound))?;
    Ok(AppJson(session.info().await))
}

/// `POST /w{worker}/api/kick_player/:g/:c`.
#[instrument(skip(state))]
pub async fn kick_player(
    State(state): State<AppState>,
    Path((_worker, game_id, client_id)): Path<(u32, String, String)>,
    _admin: AdminAuth,
) -> Result<StatusCode, AppError> {
    let session = state
        .sessions
        .lookup(&game_id)
        .await
        .ok_or_else(|| AppError::new(AppErrorKind::NotFound))?;

    session
        .kick_client(ClientId(client_id), "kicked by admin")
        .await;

    Ok(StatusCode::OK)
}

/// A finished singleplayer (practice) match's turn log, sunk directly to
/// the archive without ever having run through a live session.
#[derive(Debug, Deserialize)]
pub struct ArchiveSingleplayerGameRequest {
    pub session_id: String,
    pub turns: Vec<turnkeep_model::session::Turn>,
}

/// `POST /w{worker}/api/archive_singleplayer_game`.
#[instrument(skip(state, request))]
pub async fn archive_singleplayer_game(
    State(state): State<AppState>,
    AppJson(request): AppJson<ArchiveSingleplayerGameRequest>,
) -> Result<StatusCode, AppError> {
    for turn in &request.turns {
        state
            .archive
            .append_turn(&request.session_id, turn)
            .await
            .map_err(AppErrorKind::Archive)?;
    }
    state
        .archive
        .finalize(&request.session_id)
        .await
        .map_err(AppErrorKind::Archive)?;

    Ok(StatusCode::OK)
}
