//! The replay-archive collaborator.
//!
//! Persisting finished-session turn logs for later spectation/replay is in
//! scope as a seam (`SPEC_FULL.md` §C); the storage backend itself (S3 or
//! similar) is explicitly out of scope, so only the trait and an in-memory
//! implementation are built here.

pub mod memory;
pub mod object_store;

pub use memory::InMemoryArchiveSink;
pub use object_store::ObjectStoreArchiveSink;

use turnkeep_model::session::Turn;

/// Appends a finished (or in-progress) session's turns somewhere durable
/// enough to replay later.
pub trait ArchiveSink: Send + Sync {
    fn append_turn<'a>(
        &'a self,
        session_id: &'a str,
        turn: &'a Turn,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>>;

    fn finalize<'a>(
        &'a self,
        session_id: &'a str,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>>;
}
