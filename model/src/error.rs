//! API error structs.

use derive_more::{Display, Error};

use serde::{Deserialize, Serialize};

/// An API error, as sent to clients over HTTP or the session/ranked
/// WebSocket protocols.
#[derive(Clone, Debug, Display, Deserialize, Error, Serialize)]
#[display("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> ApiError {
        ApiError {
            message: message.into(),
        }
    }
}
