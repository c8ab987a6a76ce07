//! `turnkeep` session server backend.
//!
//! Hosts the sharded session-control API and game WebSocket for a
//! turn-based territorial strategy game, plus the ranked matchmaking portal.

pub mod app;
pub mod archive;
pub mod auth;
pub mod cli;
pub mod config;
pub mod manager;
pub mod matchmaker;
pub mod ranked;
pub mod rate_limit;
pub mod session;
pub mod shard;
pub mod worker;
