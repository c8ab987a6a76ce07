//! An in-process `ArchiveSink`, useful for development and for tests that
//! want to assert on the recorded turn log without a real object store.

use std::collections::HashMap;
use std::sync::Mutex;

use turnkeep_model::session::Turn;

use super::ArchiveSink;

#[derive(Default)]
pub struct InMemoryArchiveSink {
    turns: Mutex<HashMap<String, Vec<Turn>>>,
}

impl InMemoryArchiveSink {
    pub fn new() -> InMemoryArchiveSink {
        InMemoryArchiveSink::default()
    }

    pub fn turns_for(&self, session_id: &str) -> Vec<Turn> {
        self.turns
            .lock()
            .expect("archive mutex poisoned")
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ArchiveSink for InMemoryArchiveSink {
    fn append_turn<'a>(
        &'a self,
        session_id: &'a str,
        turn: &'a Turn,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.turns
                .lock()
                .expect("archive mutex poisoned")
                .entry(session_id.to_owned())
                .or_default()
                .push(turn.clone());
            Ok(())
        })
    }

    fn finalize<'a>(
        &'a self,
        _session_id: &'a str,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_turns_per_session() {
        let sink = InMemoryArchiveSink::new();
        sink.append_turn("s1", &Turn::empty(0)).await.unwrap();
        sink.append_turn("s1", &Turn::empty(1)).await.unwrap();
        sink.append_turn("s2", &Turn::empty(0)).await.unwrap();

        assert_eq!(sink.turns_for("s1").len(), 2);
        assert_eq!(sink.turns_for("s2").len(), 1);
    }
}
