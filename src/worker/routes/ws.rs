//! Session WebSocket upgrade route, nested under this worker's `/w{worker}/`
//! prefix.
//!
//! Grounded on the teacher's `routes::ws::handler`: accept the upgrade,
//! then hand the raw socket to the session engine's own serve loop.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;

use crate::app::AppState;
use crate::session::WebSocket;

/// How often the transport-level heartbeat is expected; independent of the
/// simulation turn interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /w{worker}/ws/:id`.
#[axum::debug_handler]
pub async fn handler(
    State(state): State<AppState>,
    Path((_worker, session_id)): Path<(u32, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_failed_upgrade(|error| {
        tracing::error!(%error, "failed to upgrade session websocket");
    })
    .on_upgrade(move |socket| async move {
        let socket = WebSocket::new(socket, HEARTBEAT_INTERVAL);
        crate::session::serve(
            socket,
            state.sessions,
            session_id,
            addr.ip(),
            state.human_check,
        )
        .await;
    })
}
