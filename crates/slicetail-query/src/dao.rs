use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use thiserror::Error;

use slicetail_core::{Bucket, SerializedRow, Timestamp};

/// Stream of raw rows produced by one DAO query, ascending by
/// `(db_timestamp, entity_id, seq_nr)`.
pub type RowStream = BoxStream<'static, Result<SerializedRow, DaoError>>;

/// Errors surfaced by a [`QueryDao`] implementation.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// One bounded time-window query over a slice range.
///
/// The record form keeps the whole query shape in one place and lets test
/// doubles capture the exact sequence of queries the driver issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub entity_type: String,
    pub min_slice: u16,
    pub max_slice: u16,
    /// Inclusive lower bound on the commit timestamp.
    pub from_timestamp: Timestamp,
    /// Inclusive upper bound, when the histogram could provide one.
    pub to_timestamp: Option<Timestamp>,
    /// Rows closer to the database clock than this must not appear.
    pub behind_current_time: Duration,
    /// Whether this query revisits a window behind the forward cursor. The
    /// store may serve those from a different index or snapshot.
    pub backtracking: bool,
}

/// Contract over the storage layer.
///
/// Implementations own their connection handling and must tolerate a single
/// consumer per returned stream. Rows outside the window described by the
/// [`RowQuery`] must not appear in its stream.
pub trait QueryDao: Send + Sync + 'static {
    /// Read-your-writes clock from the database.
    fn current_db_timestamp(&self) -> impl Future<Output = Result<Timestamp, DaoError>> + Send;

    /// Lazily execute one bounded window query.
    fn rows_by_slices(&self, query: RowQuery) -> RowStream;

    /// Whether bucket counts for past windows can still change, as they do
    /// for stores that update rows in place.
    fn count_buckets_may_change(&self) -> bool;

    /// Row counts per 10-second bucket starting at `from`, ascending by
    /// bucket start, at most `limit` buckets.
    fn count_buckets(
        &self,
        entity_type: &str,
        min_slice: u16,
        max_slice: u16,
        from: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Bucket>, DaoError>> + Send;
}
