use thiserror::Error;

use crate::offset::Timestamp;

/// Errors raised by the event-ordering machinery.
///
/// Both variants are fatal for the stream that hits them: they mean the
/// backing store broke its sort contract or the histogram under-bounded a
/// query, never a transient condition worth retrying.
#[derive(Debug, Error)]
pub enum Error {
    #[error("event emitted out of order: {emitted} is before the {mode} cursor at {cursor}")]
    OutOfOrderEvent {
        emitted: Timestamp,
        cursor: Timestamp,
        /// "forward" or "backtracking", naming the cursor that was violated.
        mode: &'static str,
    },

    #[error("too many events share timestamp {timestamp}: {count} entities already buffered")]
    TooManyEventsSameTimestamp { timestamp: Timestamp, count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
