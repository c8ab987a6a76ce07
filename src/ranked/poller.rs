//! The queue-position poller: periodically recomputes every queued
//! ticket's place in line and pushes a fresh [`RankedMessage::QueueUpdate`]
//! to its subscriber, independent of the recalculation loop that actually
//! attempts matches.
//!
//! No teacher analogue; the cadence comes from
//! [`crate::config::MatchmakingConfig::poll_interval`].

use chrono::TimeDelta;

/// A rough ETA: one bucket position clears per recalculation sweep, so a
/// ticket `position` slots back is about `position` sweeps away.
pub fn estimate_wait(position: u32, recalculate_interval: TimeDelta) -> u32 {
    let sweep_secs = recalculate_interval.num_seconds().max(1) as u32;
    position.saturating_add(1).saturating_mul(sweep_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_of_line_still_waits_one_sweep() {
        assert_eq!(estimate_wait(0, TimeDelta::seconds(10)), 10);
    }

    #[test]
    fn further_back_waits_longer() {
        assert!(estimate_wait(3, TimeDelta::seconds(10)) > estimate_wait(0, TimeDelta::seconds(10)));
    }
}
