use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instant type used throughout the engine. Ordering decisions are always
/// made on database-assigned timestamps of this type, never on reader-side
/// clocks.
pub type Timestamp = DateTime<Utc>;

/// The instant zero offsets sit at.
pub fn epoch() -> Timestamp {
    DateTime::UNIX_EPOCH
}

/// Offset of the last emitted event.
///
/// `timestamp` is the database commit instant of that event. `seen` maps each
/// entity id to the highest sequence number already emitted at exactly
/// `timestamp`; it is what makes redelivery of the same instant safe, and it
/// resets whenever the cursor moves to a strictly greater timestamp.
/// `read_timestamp` is the reader-side database clock at fetch time,
/// diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampOffset {
    pub timestamp: Timestamp,
    pub read_timestamp: Timestamp,
    #[serde(default)]
    pub seen: HashMap<String, i64>,
}

impl TimestampOffset {
    /// The zero offset: epoch with nothing seen.
    pub fn zero() -> Self {
        Self {
            timestamp: epoch(),
            read_timestamp: epoch(),
            seen: HashMap::new(),
        }
    }

    /// Offset at a bare timestamp with nothing seen yet.
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            read_timestamp: epoch(),
            seen: HashMap::new(),
        }
    }

    pub fn new(timestamp: Timestamp, read_timestamp: Timestamp, seen: HashMap<String, i64>) -> Self {
        Self {
            timestamp,
            read_timestamp,
            seen,
        }
    }

    /// Whether this offset has never advanced past the epoch.
    pub fn is_zero(&self) -> bool {
        self.timestamp == epoch()
    }
}

impl Default for TimestampOffset {
    fn default() -> Self {
        Self::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_zero_offset() {
        let zero = TimestampOffset::zero();
        assert!(zero.is_zero());
        assert!(zero.seen.is_empty());
        assert_eq!(zero.timestamp, epoch());
    }

    #[test]
    fn test_at_is_not_zero() {
        let offset = TimestampOffset::at(epoch() + TimeDelta::seconds(1));
        assert!(!offset.is_zero());
        assert!(offset.seen.is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let offset = TimestampOffset::new(
            epoch() + TimeDelta::milliseconds(1234),
            epoch() + TimeDelta::milliseconds(1240),
            [("entity-1".to_string(), 7i64)].into_iter().collect(),
        );

        let json = serde_json::to_string(&offset).unwrap();
        let back: TimestampOffset = serde_json::from_str(&json).unwrap();
        assert_eq!(offset, back);
    }

    #[test]
    fn test_seen_defaults_to_empty() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","read_timestamp":"2024-01-01T00:00:00Z"}"#;
        let offset: TimestampOffset = serde_json::from_str(json).unwrap();
        assert!(offset.seen.is_empty());
    }
}
