use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Active,
    Suspect,
    Dead,
}

/// Heartbeat periods strictly exceeded since `last_seen`: a peer seen exactly
/// one period ago has missed nothing. A peer whose clock runs ahead
/// (negative elapsed time) has missed nothing either.
pub fn missed_heartbeats(
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
    heartbeat_period: Duration,
) -> u32 {
    let elapsed = match now.signed_duration_since(last_seen).to_std() {
        Ok(elapsed) => elapsed,
        Err(_) => return 0,
    };

    let period = heartbeat_period.as_nanos().max(1);
    let missed = elapsed.as_nanos().saturating_sub(1) / period;
    u32::try_from(missed).unwrap_or(u32::MAX)
}

pub fn classify(missed: u32, threshold: u32) -> PeerState {
    if missed == 0 {
        PeerState::Active
    } else if missed < threshold {
        PeerState::Suspect
    } else {
        PeerState::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missed_counts_periods_strictly_exceeded() {
        let start = Utc::now();
        let period = Duration::from_millis(100);
        let after = |millis| start + chrono::Duration::milliseconds(millis);

        assert_eq!(missed_heartbeats(start, start, period), 0);
        assert_eq!(missed_heartbeats(start, after(99), period), 0);
        assert_eq!(missed_heartbeats(start, after(100), period), 0);
        assert_eq!(missed_heartbeats(start, after(101), period), 1);
        assert_eq!(missed_heartbeats(start, after(200), period), 1);
        assert_eq!(missed_heartbeats(start, after(201), period), 2);
        assert_eq!(missed_heartbeats(start, after(250), period), 2);
        assert_eq!(
            missed_heartbeats(start, start - chrono::Duration::seconds(5), period),
            0
        );
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(0, 2), PeerState::Active);
        assert_eq!(classify(1, 2), PeerState::Suspect);
        assert_eq!(classify(2, 2), PeerState::Dead);
        assert_eq!(classify(7, 2), PeerState::Dead);
        assert_eq!(classify(1, 1), PeerState::Dead);
    }
}
