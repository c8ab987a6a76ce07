//! Stub for a durable, object-store-backed archive.
//!
//! S3 (or equivalent) archival internals are explicitly out of scope; this
//! exists only so the `ArchiveSink` seam has a named "this is where it
//! would plug in" implementation rather than leaving callers to improvise
//! one.

use super::ArchiveSink;

pub struct ObjectStoreArchiveSink {
    _bucket: String,
}

impl ObjectStoreArchiveSink {
    pub fn new(bucket: impl Into<String>) -> ObjectStoreArchiveSink {
        ObjectStoreArchiveSink {
            _bucket: bucket.into(),
        }
    }
}

impl ArchiveSink for ObjectStoreArchiveSink {
    fn append_turn<'a>(
        &'a self,
        _session_id: &'a str,
        _turn: &'a turnkeep_model::session::Turn,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async {
            Err(anyhow::anyhow!(
                "object-store archival is not implemented; configure the in-memory sink or bring your own ArchiveSink"
            ))
        })
    }

    fn finalize<'a>(
        &'a self,
        _session_id: &'a str,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async {
            Err(anyhow::anyhow!("object-store archival is not implemented"))
        })
    }
}
