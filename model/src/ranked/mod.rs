//! Ranked matchmaking protocol wire types.

pub mod match_info;
pub mod message;
pub mod rating;
pub mod ticket;

pub use match_info::{MatchInfo, MatchState};
pub use message::{RankedClientMessage, RankedMessage};
pub use rating::{PlayerRating, RatingHistoryEntry};
pub use ticket::{QueueTicket, TicketState};
