//! The worker HTTP/WS host: session-control routes and the session
//! WebSocket upgrade, nested under this process's `/w{worker}/` shard
//! prefix.

pub mod routes;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};

use crate::app::AppState;
use crate::shard;

/// Builds the `/w{worker}/...` router. Every route in here is guarded by
/// [`shard::enforce_shard`] before the handler runs, so a request that hit
/// the wrong worker never reaches session lookup.
pub fn router(state: AppState) -> Router<AppState> {
    let api = Router::<AppState>::new()
        .route("/create_game/{id}", post(routes::session::create_game))
        .route("/start_game/{id}", post(routes::session::start_game))
        .route("/game/{id}", put(routes::session::update_game))
        .route("/game/{id}", get(routes::session::game_info))
        .route("/game/{id}/exists", get(routes::session::game_exists))
        .route(
            "/archive_singleplayer_game",
            post(routes::session::archive_singleplayer_game),
        )
        .route("/kick_player/{g}/{c}", post(routes::session::kick_player));

    Router::<AppState>::new()
        .nest(
            "/w{worker}",
            Router::<AppState>::new()
                .nest("/api", api)
                .route("/ws/{id}", get(routes::ws::handler)),
        )
        .route_layer(from_fn_with_state(state, shard::enforce_shard))
}
