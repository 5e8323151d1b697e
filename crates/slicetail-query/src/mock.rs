//! Scripted in-memory DAO for driving the query engine in tests.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};

use slicetail_core::{Bucket, SerializedRow, Timestamp};

use crate::dao::{DaoError, QueryDao, RowQuery, RowStream};

/// A scripted DAO.
///
/// Each row query pops the next prepared batch (an exhausted script keeps
/// serving empty batches), and every call is recorded so tests can assert on
/// the exact query sequence the driver produced.
#[derive(Clone, Default)]
pub struct MockDao {
    state: Arc<Mutex<MockDaoState>>,
}

#[derive(Default)]
struct MockDaoState {
    batches: VecDeque<Vec<SerializedRow>>,
    queries: Vec<RowQuery>,
    buckets: Vec<Bucket>,
    bucket_queries: Vec<Timestamp>,
    current_db_timestamp: Option<Timestamp>,
    current_db_timestamp_calls: usize,
    counts_may_change: bool,
    fail_with: Option<String>,
}

impl MockDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// DAO whose every operation fails with the given message.
    pub fn failing(message: impl Into<String>) -> Self {
        let dao = Self::new();
        dao.state.lock().unwrap().fail_with = Some(message.into());
        dao
    }

    /// Queue a batch served by the next row query.
    pub fn push_batch(&self, rows: Vec<SerializedRow>) {
        self.state.lock().unwrap().batches.push_back(rows);
    }

    /// Buckets returned by every `count_buckets` call.
    pub fn set_buckets(&self, buckets: Vec<Bucket>) {
        self.state.lock().unwrap().buckets = buckets;
    }

    pub fn set_current_db_timestamp(&self, timestamp: Timestamp) {
        self.state.lock().unwrap().current_db_timestamp = Some(timestamp);
    }

    pub fn set_counts_may_change(&self, value: bool) {
        self.state.lock().unwrap().counts_may_change = value;
    }

    /// All row queries issued so far.
    pub fn queries(&self) -> Vec<RowQuery> {
        self.state.lock().unwrap().queries.clone()
    }

    /// `from` arguments of all bucket count calls.
    pub fn bucket_queries(&self) -> Vec<Timestamp> {
        self.state.lock().unwrap().bucket_queries.clone()
    }

    pub fn current_db_timestamp_calls(&self) -> usize {
        self.state.lock().unwrap().current_db_timestamp_calls
    }
}

impl QueryDao for MockDao {
    fn current_db_timestamp(&self) -> impl Future<Output = Result<Timestamp, DaoError>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();
            state.current_db_timestamp_calls += 1;

            if let Some(ref message) = state.fail_with {
                return Err(DaoError::Connection(message.clone()));
            }
            state
                .current_db_timestamp
                .ok_or_else(|| DaoError::Query("no current timestamp scripted".to_string()))
        }
    }

    fn rows_by_slices(&self, query: RowQuery) -> RowStream {
        let mut state = self.state.lock().unwrap();
        state.queries.push(query);

        if let Some(ref message) = state.fail_with {
            let err = DaoError::Query(message.clone());
            return stream::once(std::future::ready(Err(err))).boxed();
        }

        let rows = state.batches.pop_front().unwrap_or_default();
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }

    fn count_buckets_may_change(&self) -> bool {
        self.state.lock().unwrap().counts_may_change
    }

    fn count_buckets(
        &self,
        _entity_type: &str,
        _min_slice: u16,
        _max_slice: u16,
        from: Timestamp,
        _limit: usize,
    ) -> impl Future<Output = Result<Vec<Bucket>, DaoError>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();
            state.bucket_queries.push(from);

            if let Some(ref message) = state.fail_with {
                return Err(DaoError::Query(message.clone()));
            }
            Ok(state.buckets.clone())
        }
    }
}
