//! Wire types shared between the session protocol, the ranked protocol, and
//! any client implementing either.

pub mod error;
pub mod ranked;
pub mod session;

pub use error::ApiError;
pub use ranked::{MatchInfo, PlayerRating, QueueTicket};
pub use session::{
    ClientMessage, GameStartInfo, Intent, ServerMessage, SessionConfig, SessionInfo, Turn,
    WinnerDescriptor,
};
