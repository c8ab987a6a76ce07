//! A single numbered turn: the unit of agreement between the session engine
//! and every connected client.

use serde::{Deserialize, Serialize};

use super::intent::Intent;

/// One tick of the turn stream.
///
/// `turn_number` is strictly increasing and gap-free within a session; a
/// client that has seen turn `n` can always ask for turn `n + 1` next.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Turn {
    pub turn_number: u64,
    #[serde(default)]
    pub intents: Vec<Intent>,
    /// The adopted reconciliation hash for this turn, once reconciliation
    /// has run and a majority was found. Written back onto the stored turn
    /// so late joiners receive the canonical value instead of re-deriving
    /// it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u64>,
}

impl Turn {
    pub fn empty(turn_number: u64) -> Turn {
        Turn {
            turn_number,
            intents: Vec::new(),
            hash: None,
        }
    }
}
