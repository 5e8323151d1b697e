//! Histogram of per-bucket row counts along the timestamp axis.
//!
//! The driver must bound each query's upper timestamp before the database
//! applies its own LIMIT; a sorted query over an oversized candidate set is
//! expensive. The histogram answers "what timestamp is at least N rows past
//! `from`?" cheaply enough to consult on every query.

use std::collections::BTreeMap;
use std::ops::Bound;

use chrono::DateTime;

use crate::offset::{epoch, Timestamp};

/// Width of one histogram bucket on the timestamp axis.
pub const BUCKET_DURATION_SECONDS: i64 = 10;

/// Maximum number of buckets fetched from the DAO per refresh.
pub const BUCKET_LIMIT: usize = 10_000;

/// One 10-second window of the timestamp axis and its row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Window start in epoch seconds, a multiple of 10.
    pub start_seconds: i64,
    pub count: i64,
}

impl Bucket {
    pub fn new(start_seconds: i64, count: i64) -> Self {
        Self {
            start_seconds,
            count,
        }
    }
}

/// Sorted bucket counts plus the instant they were first populated.
///
/// Every operation returns a new value; the enclosing query state shares the
/// histogram by cloning, so updates are copy-on-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketCounts {
    counts: BTreeMap<i64, i64>,
    created_at: Timestamp,
}

impl BucketCounts {
    /// An empty histogram. `created_at` is stamped when content first
    /// arrives through [`BucketCounts::add`].
    pub fn empty() -> Self {
        Self {
            counts: BTreeMap::new(),
            created_at: epoch(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Instant the histogram first received content.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Total row count across all buckets.
    pub fn total_count(&self) -> i64 {
        self.counts.values().sum()
    }

    /// Replace-or-insert the given buckets.
    ///
    /// `created_at` is stamped with `now` only when the histogram was empty
    /// before the call; later additions keep the original stamp.
    pub fn add(&self, buckets: &[Bucket], now: Timestamp) -> Self {
        let mut counts = self.counts.clone();
        for bucket in buckets {
            counts.insert(bucket.start_seconds, bucket.count);
        }
        let created_at = if self.counts.is_empty() {
            now
        } else {
            self.created_at
        };
        Self { counts, created_at }
    }

    /// Drop all buckets that end at or before `until`.
    ///
    /// Keeps the last bucket when the drop would otherwise empty a
    /// previously non-empty histogram, and returns an equal value when
    /// nothing would be dropped.
    pub fn clear_until(&self, until: Timestamp) -> Self {
        let limit = until.timestamp() - BUCKET_DURATION_SECONDS;
        let retained: BTreeMap<i64, i64> = self
            .counts
            .range((Bound::Excluded(limit), Bound::Unbounded))
            .map(|(start, count)| (*start, *count))
            .collect();

        if retained.len() == self.counts.len() {
            return self.clone();
        }
        if retained.is_empty() {
            let last = self.counts.iter().next_back().map(|(start, count)| (*start, *count));
            return Self {
                counts: last.into_iter().collect(),
                created_at: self.created_at,
            };
        }
        Self {
            counts: retained,
            created_at: self.created_at,
        }
    }

    /// End of the first bucket past `from` at which the cumulative row count
    /// reaches `at_least`, or `None` when the known horizon cannot satisfy
    /// it.
    pub fn find_time_for_limit(&self, from: Timestamp, at_least: usize) -> Option<Timestamp> {
        let from_seconds = from.timestamp();
        let mut sum: i64 = 0;
        for (start, count) in self
            .counts
            .range((Bound::Excluded(from_seconds), Bound::Unbounded))
        {
            sum += count;
            if sum >= at_least as i64 {
                return DateTime::from_timestamp(start + BUCKET_DURATION_SECONDS, 0);
            }
        }
        None
    }
}

impl Default for BucketCounts {
    fn default() -> Self {
        Self::empty()
    }
}
