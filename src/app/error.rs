//! Application error that may occur during the processing of a request.
//!
//! See [`AppError`].

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use axum::{
    extract::rejection::JsonRejection,
    response::{IntoResponse, Response},
};

use derive_more::{Display, From};

use http::StatusCode;

use turnkeep_model::ApiError;

use crate::app::AppJson;

/// Application error that may occur during the processing of a request.
///
/// This includes both internal errors and user errors.
#[derive(Debug)]
pub struct AppError {
    kind: AppErrorKind,
    message: Option<String>,
}

impl AppError {
    pub fn new(kind: impl Into<AppErrorKind>) -> AppError {
        AppError {
            kind: kind.into(),
            message: None,
        }
    }

    pub fn with_message(kind: impl Into<AppErrorKind>, message: impl Into<String>) -> AppError {
        AppError {
            kind: kind.into(),
            message: Some(message.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> AppError {
        AppError::with_message(AppErrorKind::NotFound, message)
    }

    /// The inner [`AppErrorKind`] of the error.
    pub fn kind(&self) -> &AppErrorKind {
        &self.kind
    }

    /// Discards the error message, unwrapping the inner error.
    pub fn into_kind(self) -> AppErrorKind {
        self.kind
    }

    /// Whether this error reflects a bug/outage on our side rather than
    /// caller misuse, for the WebSocket close-code decision (1011 vs 1002).
    pub fn is_internal(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::Database(_)
                | AppErrorKind::WebSocket(_)
                | AppErrorKind::RoleProvider(_)
                | AppErrorKind::Archive(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.message.as_ref() {
            Some(msg) => f.write_str(msg),
            None => Display::fmt(&self.kind, f),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            AppErrorKind::Json(err) => Some(err),
            AppErrorKind::Database(err) => Some(err),
            AppErrorKind::Jwt(err) => Some(err),
            AppErrorKind::WebSocket(err) => Some(err),
            _ => None,
        }
    }
}

impl<T> From<T> for AppError
where
    T: Into<AppErrorKind>,
{
    fn from(value: T) -> Self {
        AppError {
            kind: value.into(),
            message: None,
        }
    }
}

/// The specific kind of error that happened.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum AppErrorKind {
    /// The request's JSON payload was malformed or invalid.
    #[display("{_0}")]
    Json(JsonRejection),
    /// The request body failed `garde` validation.
    #[display("{_0}")]
    #[from(skip)]
    Validation(garde::Report),
    /// No session, match, or ticket exists with the given id.
    #[display("not found")]
    NotFound,
    /// The session or match is not in a state that accepts this operation
    /// (e.g. a config patch after `Start()`, a join after the roster froze).
    #[display("invalid state for this operation")]
    InvalidState,
    /// This worker does not own the shard the requested session id hashes
    /// to; the caller should retry against the `/wN/...` prefix this worker
    /// reports.
    #[display("wrong shard")]
    WrongShard,
    /// The bearer token was missing, malformed, or failed verification.
    #[display("unauthenticated")]
    Unauthenticated,
    /// The caller is authenticated but lacks the role/allow-list membership
    /// the session requires.
    #[display("forbidden")]
    Forbidden,
    /// The requested mutation conflicts with current state (already
    /// queued, already started, duplicate join).
    #[display("{_0}")]
    #[from(skip)]
    Conflict(String),
    /// The caller's source IP has exceeded the outer per-IP request cap.
    #[display("rate limit exceeded")]
    RateExceeded,
    /// A request body that isn't routed through the `garde`-validated
    /// `Payload` extractor (raw bytes, manually parsed) failed to parse.
    #[display("{_0}")]
    #[from(skip)]
    BadRequest(String),
    #[display("{_0}")]
    Jwt(jsonwebtoken::errors::Error),
    #[display("{_0}")]
    Database(sqlx::Error),
    #[display("{_0}")]
    WebSocket(axum::Error),
    /// The external role-provider collaborator (Discord) failed or timed
    /// out.
    #[display("{_0}")]
    #[from(skip)]
    RoleProvider(anyhow::Error),
    /// The archive sink failed to persist or finalize a session record.
    #[display("{_0}")]
    #[from(skip)]
    Archive(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut internal_error = None;

        let (status, mut error) = match self.kind {
            AppErrorKind::Json(error) => (
                StatusCode::BAD_REQUEST,
                ApiError::new(error.to_string()),
            ),
            AppErrorKind::Validation(ref report) => {
                (StatusCode::UNPROCESSABLE_ENTITY, ApiError::new(report.to_string()))
            }
            AppErrorKind::NotFound => (StatusCode::NOT_FOUND, ApiError::new("not found")),
            AppErrorKind::InvalidState => (
                StatusCode::CONFLICT,
                ApiError::new("invalid state for this operation"),
            ),
            AppErrorKind::WrongShard => {
                (StatusCode::MISDIRECTED_REQUEST, ApiError::new("wrong shard"))
            }
            AppErrorKind::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, ApiError::new("unauthenticated"))
            }
            AppErrorKind::Forbidden => (StatusCode::FORBIDDEN, ApiError::new("forbidden")),
            AppErrorKind::Conflict(ref msg) => (StatusCode::CONFLICT, ApiError::new(msg.clone())),
            AppErrorKind::RateExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                ApiError::new("rate limit exceeded"),
            ),
            AppErrorKind::BadRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, ApiError::new(msg.clone()))
            }
            // fallthrough for internal server errors not turned into user
            // errors above
            error => {
                internal_error = Some(error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::new("An internal server error occured."),
                )
            }
        };

        // replace error message
        if let Some(message) = self.message {
            error.message = message;
        }

        let mut response = (status, AppJson(error)).into_response();
        if let Some(error) = internal_error {
            response.extensions_mut().insert(Arc::new(error));
        }
        response
    }
}
