//! Duplicate suppression within a commit timestamp.
//!
//! The engine revisits time windows, both when a query is re-seeded from an
//! offset and when backtracking re-reads history, so the same row can arrive
//! more than once. Rows are totally ordered within a query; what needs state
//! is telling apart "new row at the current timestamp" from "row already
//! covered by the offset we started from".

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::offset::{Timestamp, TimestampOffset};
use crate::row::SerializedRow;

/// Assigns offsets to rows and drops duplicates at equal timestamps.
///
/// One instance belongs to the consumer side of a single query's stream; a
/// retried query gets a fresh instance seeded from the then-current offset,
/// so no stale suppression state survives a retry.
#[derive(Debug)]
pub struct Deduplicator {
    buffer_size: usize,
    current_timestamp: Timestamp,
    current_seen: HashMap<String, i64>,
}

impl Deduplicator {
    /// Seed from the offset the query starts at.
    pub fn new(start: &TimestampOffset, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            current_timestamp: start.timestamp,
            current_seen: start.seen.clone(),
        }
    }

    /// Offset to emit for `row`, or `None` when the row is a duplicate.
    ///
    /// Fails with [`Error::TooManyEventsSameTimestamp`] when more entities
    /// than `buffer_size` share one commit timestamp. That points at a
    /// histogram or DAO ordering bug, not a normal condition.
    pub fn offset_for(&mut self, row: &SerializedRow) -> Result<Option<TimestampOffset>> {
        if row.db_timestamp == self.current_timestamp {
            if self
                .current_seen
                .get(&row.entity_id)
                .is_some_and(|seen| *seen >= row.seq_nr)
            {
                return Ok(None);
            }
            if self.current_seen.len() >= self.buffer_size {
                return Err(Error::TooManyEventsSameTimestamp {
                    timestamp: self.current_timestamp,
                    count: self.current_seen.len(),
                });
            }
            self.current_seen.insert(row.entity_id.clone(), row.seq_nr);
        } else {
            self.current_timestamp = row.db_timestamp;
            self.current_seen.clear();
            self.current_seen.insert(row.entity_id.clone(), row.seq_nr);
        }

        Ok(Some(TimestampOffset {
            timestamp: self.current_timestamp,
            read_timestamp: row.read_db_timestamp,
            seen: self.current_seen.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn t0() -> Timestamp {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn row(entity_id: &str, seq_nr: i64, millis: i64) -> SerializedRow {
        SerializedRow {
            entity_id: entity_id.to_string(),
            seq_nr,
            db_timestamp: t0() + TimeDelta::milliseconds(millis),
            read_db_timestamp: t0() + TimeDelta::milliseconds(millis),
            payload: Some(vec![1]),
        }
    }

    fn offsets(rows: &[SerializedRow], start: &TimestampOffset) -> Vec<TimestampOffset> {
        let mut dedup = Deduplicator::new(start, 100);
        rows.iter()
            .filter_map(|row| dedup.offset_for(row).unwrap())
            .collect()
    }

    #[test]
    fn test_simple_forward() {
        let emitted = offsets(
            &[row("p1", 1, 0), row("p1", 2, 1), row("p1", 3, 2)],
            &TimestampOffset::zero(),
        );

        assert_eq!(emitted.len(), 3);
        for (i, offset) in emitted.iter().enumerate() {
            assert_eq!(offset.timestamp, t0() + TimeDelta::milliseconds(i as i64));
            assert_eq!(offset.seen, [("p1".to_string(), i as i64 + 1)].into_iter().collect());
        }
    }

    #[test]
    fn test_same_timestamp_tie() {
        let emitted = offsets(
            &[row("p1", 1, 0), row("p2", 1, 0), row("p1", 2, 1)],
            &TimestampOffset::zero(),
        );

        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0].timestamp, t0());
        assert_eq!(emitted[1].timestamp, t0());
        assert_eq!(
            emitted[0].seen,
            [("p1".to_string(), 1)].into_iter().collect()
        );
        assert_eq!(
            emitted[1].seen,
            [("p1".to_string(), 1), ("p2".to_string(), 1)].into_iter().collect()
        );
        // The next timestamp resets seen to a singleton.
        assert_eq!(
            emitted[2].seen,
            [("p1".to_string(), 2)].into_iter().collect()
        );
    }

    #[test]
    fn test_duplicate_suppression() {
        let emitted = offsets(
            &[row("p1", 1, 0), row("p1", 1, 0), row("p1", 2, 1)],
            &TimestampOffset::zero(),
        );

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].seen, [("p1".to_string(), 1)].into_iter().collect());
        assert_eq!(emitted[1].seen, [("p1".to_string(), 2)].into_iter().collect());
    }

    #[test]
    fn test_rows_covered_by_seed_offset_are_dropped() {
        let seed = TimestampOffset::new(
            t0(),
            t0(),
            [("p1".to_string(), 2)].into_iter().collect(),
        );

        let emitted = offsets(&[row("p1", 1, 0), row("p1", 2, 0), row("p1", 3, 0)], &seed);

        assert_eq!(emitted.len(), 1);
        assert_eq!(
            emitted[0].seen,
            [("p1".to_string(), 3)].into_iter().collect()
        );
    }

    #[test]
    fn test_duplicate_prefix_equals_deduplicated_input() {
        // A query re-seeded from an offset has an inclusive lower bound, so
        // the rows it replays all sit at the seed timestamp.
        let seed = TimestampOffset::new(
            t0(),
            t0(),
            [("p1".to_string(), 1), ("p2".to_string(), 1)].into_iter().collect(),
        );
        let originals = [row("p3", 1, 0), row("p1", 2, 1), row("p3", 2, 1)];
        let with_prefix = [
            row("p1", 1, 0),
            row("p2", 1, 0),
            row("p3", 1, 0),
            row("p1", 2, 1),
            row("p3", 2, 1),
        ];

        let plain = offsets(&originals, &seed);
        let replayed = offsets(&with_prefix, &seed);

        assert_eq!(plain, replayed);
        assert_eq!(plain.len(), 3);
    }

    #[test]
    fn test_too_many_entities_at_one_timestamp() {
        let mut dedup = Deduplicator::new(&TimestampOffset::zero(), 2);

        assert!(dedup.offset_for(&row("p1", 1, 0)).unwrap().is_some());
        assert!(dedup.offset_for(&row("p2", 1, 0)).unwrap().is_some());

        let err = dedup.offset_for(&row("p3", 1, 0)).unwrap_err();
        assert!(matches!(err, Error::TooManyEventsSameTimestamp { count: 2, .. }));
    }
}
