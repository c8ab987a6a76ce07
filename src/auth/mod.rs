//! Authentication for the worker-to-worker and game-client session-control
//! API, and the role-provider collaborator session configs can gate on.

pub mod admin;
pub mod human_check;
pub mod jwt;
pub mod roles;

use axum::extract::{FromRef, FromRequestParts};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use http::request::Parts;

use crate::app::AppState;
use crate::app::error::{AppError, AppErrorKind};
use jwt::Claims;

/// The caller of a session-control API request, as established by a
/// verified bearer JWT.
#[derive(Clone, Debug)]
pub struct AuthenticatedClient {
    pub claims: Claims,
}

impl<S> FromRequestParts<S> for AuthenticatedClient
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::new(AppErrorKind::Unauthenticated))?;

        let claims = app_state
            .jwt
            .verify(bearer.token())
            .map_err(|_| AppError::new(AppErrorKind::Unauthenticated))?;

        Ok(AuthenticatedClient { claims })
    }
}
