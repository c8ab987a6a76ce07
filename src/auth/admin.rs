//! Admin-header authentication, for the public-lobby creation and
//! `kick_player` routes (`SPEC_FULL.md` §6) that a bearer-JWT identity has
//! no business calling.
//!
//! Shaped the same way as the teacher's `api_key::ServerAuthentication`: a
//! zero-sized marker extractor that either succeeds or rejects, with the
//! actual header comparison done against the configured admin token.

use axum::extract::{FromRef, FromRequestParts};

use http::request::Parts;

use crate::app::AppState;
use crate::app::error::{AppError, AppErrorKind};

/// Proof the request carried the configured admin header and token.
#[derive(Clone, Copy, Debug)]
pub struct AdminAuth;

impl<S> FromRequestParts<S> for AdminAuth
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        let Some(expected) = state.auth.admin_token.as_ref() else {
            return Err(AppError::new(AppErrorKind::Forbidden));
        };

        let presented = parts
            .headers
            .get(state.auth.admin_header_name.as_str())
            .and_then(|value| value.to_str().ok());

        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(AdminAuth),
            _ => Err(AppError::new(AppErrorKind::Unauthenticated)),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
