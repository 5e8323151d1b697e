use thiserror::Error;

use crate::dao::DaoError;

/// Failure of an envelope stream.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The ordering machinery detected a contract violation. Fatal for the
    /// stream; nothing downstream can repair a misordered cursor.
    #[error(transparent)]
    Ordering(#[from] slicetail_core::Error),

    /// The backing store failed. Surfaced as-is, never retried here; restart
    /// policy belongs to the embedding runtime.
    #[error(transparent)]
    Dao(#[from] DaoError),
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;
