//! The ranked matchmaking portal: a queue, an accept coordinator, a Glicko-2
//! rating engine, and the coordinator that wires them to the session
//! manager, plus the repository and HTTP/WS surface on top.

pub mod accept;
pub mod coordinator;
pub mod poller;
pub mod queue;
pub mod rating;
pub mod repository;
pub mod routes;

pub use coordinator::RankedCoordinator;
