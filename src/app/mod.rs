//! Application interface and state.

pub mod error;

pub use error::AppError;

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequest, Request},
    response::{IntoResponse, Response},
};

use derive_more::Deref;

use garde::Validate;
use sqlx::SqlitePool;

use crate::archive::ArchiveSink;
use crate::auth::{human_check::HumanCheck, jwt::JwtVerifier, roles::RoleProvider};
use crate::config::AuthConfig;
use crate::manager::SessionManager;
use crate::ranked::coordinator::RankedCoordinator;
use crate::rate_limit::RateLimiter;

/// Shared app state.
///
/// Cheaply cloneable; every field is itself an `Arc` or a pool handle.
#[derive(Clone)]
pub struct AppState {
    /// The database connection pool.
    pub db: SqlitePool,
    /// This process's worker identity and shard count.
    pub worker_id: u32,
    pub num_workers: u32,
    pub sessions: Arc<SessionManager>,
    pub ranked: Arc<RankedCoordinator>,
    pub jwt: Arc<JwtVerifier>,
    pub roles: Arc<dyn RoleProvider>,
    pub auth: Arc<AuthConfig>,
    /// The same sink every live session archives through, exposed directly
    /// for the singleplayer-record route, which never creates a session.
    pub archive: Arc<dyn ArchiveSink>,
    /// The outer per-IP request cap, shared across every route.
    pub rate_limiter: Arc<RateLimiter>,
    /// Proof-of-humanity verification for fresh joins.
    pub human_check: Arc<dyn HumanCheck>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("worker_id", &self.worker_id)
            .field("num_workers", &self.num_workers)
            .finish_non_exhaustive()
    }
}

/// App JSON extractor and responder.
#[derive(Deref, FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

impl<T> IntoResponse for AppJson<T>
where
    Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        Json(self.0).into_response()
    }
}

/// A JSON request body that is `garde`-validated before the handler sees
/// it, rejecting with [`AppErrorKind::Validation`](error::AppErrorKind::Validation)
/// on the first violation.
#[derive(Deref)]
pub struct Payload<T>(pub T);

impl<T, S> FromRequest<S> for Payload<T>
where
    T: Validate<Context = ()> + 'static,
    AppJson<T>: FromRequest<S>,
    <AppJson<T> as FromRequest<S>>::Rejection: Into<AppError>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let AppJson(value) = AppJson::<T>::from_request(req, state)
            .await
            .map_err(Into::into)?;
        value
            .validate()
            .map_err(error::AppErrorKind::Validation)?;
        Ok(Payload(value))
    }
}
