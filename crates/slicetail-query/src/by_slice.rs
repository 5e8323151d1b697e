//! By-slice query driver.
//!
//! Issues bounded time-window queries against the DAO, threads an immutable
//! cursor state through the pull loop, and emits deduplicated offset-bearing
//! envelopes. Live streams interleave forward progress with backtracking
//! windows that re-read recent history for rows whose commit became visible
//! late.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures::future::FutureExt;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use tracing::debug;

use slicetail_core::{
    epoch, BucketCounts, Clock, Deduplicator, Error as CoreError, QuerySettings, SerializedRow,
    Timestamp, TimestampOffset, BUCKET_LIMIT,
};

use crate::continuous::{adjust_next_delay, continuous_query};
use crate::dao::{QueryDao, RowQuery};
use crate::error::{QueryError, QueryResult};

/// How long a populated histogram stays fresh before a refresh is considered.
const BUCKET_REFRESH_SECONDS: i64 = 60;

/// Envelope constructor supplied by the caller, keeping the driver agnostic
/// to the outward envelope type.
pub type CreateEnvelope<E> = Arc<dyn Fn(TimestampOffset, SerializedRow) -> E + Send + Sync>;

/// Offset accessor for the caller's envelope type.
pub type ExtractOffset<E> = Arc<dyn Fn(&E) -> &TimestampOffset + Send + Sync>;

/// Immutable snapshot of the driver's position, replaced wholesale on every
/// transition.
#[derive(Debug, Clone)]
pub(crate) struct QueryState {
    /// Forward cursor; non-decreasing for the lifetime of the stream.
    latest: TimestampOffset,
    /// Envelopes emitted by the last completed query.
    row_count: usize,
    query_count: u64,
    /// Consecutive queries that emitted nothing.
    idle_count: u64,
    backtracking: bool,
    /// Cursor used while backtracking; never ahead of `latest`.
    latest_backtracking: TimestampOffset,
    buckets: BucketCounts,
}

impl QueryState {
    fn initial(offset: Option<TimestampOffset>) -> Self {
        Self {
            latest: offset.unwrap_or_else(TimestampOffset::zero),
            row_count: 0,
            query_count: 0,
            idle_count: 0,
            backtracking: false,
            latest_backtracking: TimestampOffset::zero(),
            buckets: BucketCounts::empty(),
        }
    }

    /// Offset the next query is seeded from.
    fn current_offset(&self) -> &TimestampOffset {
        if self.backtracking {
            &self.latest_backtracking
        } else {
            &self.latest
        }
    }

    fn next_query_from_timestamp(&self) -> Timestamp {
        self.current_offset().timestamp
    }

    /// Histogram-derived upper bound for the next query.
    ///
    /// While backtracking the bound is capped at the forward cursor, and the
    /// forward cursor stands in when the histogram has no answer; a forward
    /// query without a histogram answer runs unbounded and relies on the
    /// DAO's own LIMIT.
    fn next_query_to_timestamp(&self, at_least: usize) -> Option<Timestamp> {
        let found = self
            .buckets
            .find_time_for_limit(self.next_query_from_timestamp(), at_least);
        match found {
            Some(t) if self.backtracking && t > self.latest.timestamp => {
                Some(self.latest.timestamp)
            }
            Some(t) => Some(t),
            None if self.backtracking => Some(self.latest.timestamp),
            None => None,
        }
    }

    /// Idle counter as it stands after the just-completed query, if any.
    fn next_idle_count(&self) -> u64 {
        if self.query_count == 0 {
            0
        } else if self.row_count == 0 {
            self.idle_count + 1
        } else {
            0
        }
    }
}

fn advance_forward(state: &QueryState, offset: &TimestampOffset) -> QueryResult<QueryState> {
    if offset.timestamp < state.latest.timestamp {
        return Err(CoreError::OutOfOrderEvent {
            emitted: offset.timestamp,
            cursor: state.latest.timestamp,
            mode: "forward",
        }
        .into());
    }
    let mut next = state.clone();
    next.latest = offset.clone();
    next.row_count += 1;
    Ok(next)
}

fn advance_backtracking(state: &QueryState, offset: &TimestampOffset) -> QueryResult<QueryState> {
    if offset.timestamp < state.latest_backtracking.timestamp {
        return Err(CoreError::OutOfOrderEvent {
            emitted: offset.timestamp,
            cursor: state.latest_backtracking.timestamp,
            mode: "backtracking",
        }
        .into());
    }
    let mut next = state.clone();
    next.latest_backtracking = offset.clone();
    next.row_count += 1;
    Ok(next)
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Rows of one query, deduplicated and wrapped into envelopes.
///
/// The dedup state lives in this stream instance, on the consumer side, so a
/// re-issued query starts clean from whatever offset it is seeded with.
fn envelope_stream<D, E>(
    dao: &Arc<D>,
    create_envelope: &CreateEnvelope<E>,
    query: RowQuery,
    start: &TimestampOffset,
    buffer_size: usize,
) -> BoxStream<'static, Result<E, QueryError>>
where
    D: QueryDao,
    E: Send + 'static,
{
    let mut dedup = Deduplicator::new(start, buffer_size);
    let create_envelope = create_envelope.clone();
    dao.rows_by_slices(query)
        .filter_map(move |row| {
            let item = match row {
                Ok(row) => match dedup.offset_for(&row) {
                    Ok(Some(offset)) => Some(Ok((create_envelope)(offset, row))),
                    Ok(None) => None,
                    Err(e) => Some(Err(QueryError::Ordering(e))),
                },
                Err(e) => Some(Err(QueryError::Dao(e))),
            };
            futures::future::ready(item)
        })
        .boxed()
}

/// Time-ordered event queries over a slice range.
///
/// A plain value: the DAO handle, the envelope adapters, the settings, and a
/// clock all arrive by injection, and every returned stream is cold.
pub struct BySliceQuery<D, E> {
    dao: Arc<D>,
    create_envelope: CreateEnvelope<E>,
    extract_offset: ExtractOffset<E>,
    settings: QuerySettings,
    clock: Arc<dyn Clock>,
}

impl<D, E> BySliceQuery<D, E>
where
    D: QueryDao,
    E: Send + 'static,
{
    pub fn new(
        dao: Arc<D>,
        create_envelope: CreateEnvelope<E>,
        extract_offset: ExtractOffset<E>,
        settings: QuerySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dao,
            create_envelope,
            extract_offset,
            settings,
            clock,
        }
    }

    /// Histogram refresh, run before a query when the cached counts are
    /// stale or cannot bound the next query.
    ///
    /// For stores whose past bucket counts never change, staleness alone is
    /// not a reason to refetch; only an inadequate horizon is.
    fn before_query(
        &self,
        log_prefix: &str,
        entity_type: &str,
        min_slice: u16,
        max_slice: u16,
    ) -> impl FnMut(&QueryState) -> Option<futures::future::BoxFuture<'static, QueryResult<QueryState>>>
           + Send
           + 'static {
        let dao = self.dao.clone();
        let clock = self.clock.clone();
        let buffer_size = self.settings.buffer_size;
        let first_backtracking_window = delta(self.settings.first_backtracking_window());
        let log_prefix = log_prefix.to_string();
        let entity_type = entity_type.to_string();

        move |state: &QueryState| {
            let now = clock.now();
            let stale = state.buckets.is_empty()
                || now.signed_duration_since(state.buckets.created_at())
                    > TimeDelta::seconds(BUCKET_REFRESH_SECONDS);
            if !stale {
                return None;
            }

            let horizon_inadequate = state
                .buckets
                .find_time_for_limit(state.latest.timestamp, buffer_size)
                .is_none();
            if !dao.count_buckets_may_change() && !horizon_inadequate {
                return None;
            }

            let from_timestamp = if state.latest_backtracking.is_zero() {
                if state.latest.is_zero() {
                    epoch()
                } else {
                    state.latest.timestamp - first_backtracking_window
                }
            } else {
                state.latest_backtracking.timestamp
            };

            let dao = dao.clone();
            let entity_type = entity_type.clone();
            let log_prefix = log_prefix.clone();
            let state = state.clone();
            Some(
                async move {
                    let buckets = dao
                        .count_buckets(&entity_type, min_slice, max_slice, from_timestamp, BUCKET_LIMIT)
                        .await?;
                    debug!(
                        log_prefix = %log_prefix,
                        buckets = buckets.len(),
                        from = %from_timestamp,
                        "refreshed bucket counts"
                    );
                    let mut next = state;
                    next.buckets = next.buckets.clear_until(from_timestamp).add(&buckets, now);
                    Ok(next)
                }
                .boxed(),
            )
        }
    }

    /// Finite query: everything committed up to the database's clock at the
    /// moment the stream starts, then completion.
    ///
    /// The upper bound of every window is clamped to that initial clock
    /// reading, so events committed after the stream started are left to a
    /// later run. The stream ends after two consecutive empty queries; the
    /// second one confirms no same-timestamp stragglers remain.
    pub fn current_by_slices(
        &self,
        log_prefix: &str,
        entity_type: &str,
        min_slice: u16,
        max_slice: u16,
        offset: Option<TimestampOffset>,
    ) -> impl Stream<Item = Result<E, QueryError>> + Send + 'static {
        let dao = self.dao.clone();
        let create_envelope = self.create_envelope.clone();
        let extract_offset = self.extract_offset.clone();
        let settings = self.settings.clone();
        let before_query = self.before_query(log_prefix, entity_type, min_slice, max_slice);
        let log_prefix = log_prefix.to_string();
        let entity_type = entity_type.to_string();

        let start = async move {
            let current_db_time = dao.current_db_timestamp().await.map_err(QueryError::from)?;
            debug!(
                log_prefix = %log_prefix,
                %current_db_time,
                min_slice,
                max_slice,
                "starting current query"
            );

            let update_state = move |state: &QueryState, envelope: &E| {
                advance_forward(state, (extract_offset)(envelope))
            };

            let next_query = {
                let dao = dao.clone();
                move |state: QueryState| {
                    let idle_count = state.next_idle_count();
                    if state.query_count != 0 && idle_count >= 2 {
                        debug!(
                            log_prefix = %log_prefix,
                            query_count = state.query_count,
                            "current query exhausted"
                        );
                        return (state, None);
                    }

                    let mut next = state;
                    next.row_count = 0;
                    next.query_count += 1;
                    next.idle_count = idle_count;

                    let from_timestamp = next.latest.timestamp;
                    let to_timestamp = next
                        .next_query_to_timestamp(settings.buffer_size)
                        .map_or(current_db_time, |t| t.min(current_db_time));

                    let query = RowQuery {
                        entity_type: entity_type.clone(),
                        min_slice,
                        max_slice,
                        from_timestamp,
                        to_timestamp: Some(to_timestamp),
                        behind_current_time: Duration::ZERO,
                        backtracking: false,
                    };
                    let rows = envelope_stream(
                        &dao,
                        &create_envelope,
                        query,
                        &next.latest,
                        settings.buffer_size,
                    );
                    (next, Some(rows))
                }
            };

            Ok::<_, QueryError>(
                continuous_query(
                    QueryState::initial(offset),
                    update_state,
                    |_| None,
                    next_query,
                    before_query,
                )
                .boxed(),
            )
        };

        stream::once(start).try_flatten()
    }

    /// Infinite tailing query.
    ///
    /// Never consults the database clock; instead each query refuses rows too
    /// close to `now` (`behind_current_time`) and the driver periodically
    /// backtracks over a window behind the forward cursor to pick up rows
    /// whose commit became visible late.
    pub fn live_by_slices(
        &self,
        log_prefix: &str,
        entity_type: &str,
        min_slice: u16,
        max_slice: u16,
        offset: Option<TimestampOffset>,
    ) -> impl Stream<Item = Result<E, QueryError>> + Send + 'static {
        let dao = self.dao.clone();
        let create_envelope = self.create_envelope.clone();
        let extract_offset = self.extract_offset.clone();
        let settings = self.settings.clone();
        let before_query = self.before_query(log_prefix, entity_type, min_slice, max_slice);
        let log_prefix = log_prefix.to_string();
        let entity_type = entity_type.to_string();

        let half_backtracking_window = delta(self.settings.half_backtracking_window());
        let first_backtracking_window = delta(self.settings.first_backtracking_window());

        let update_state = move |state: &QueryState, envelope: &E| {
            let offset = (extract_offset)(envelope);
            if state.backtracking {
                advance_backtracking(state, offset)
            } else {
                advance_forward(state, offset)
            }
        };

        let delay_next_query = {
            let settings = settings.clone();
            move |state: &QueryState| {
                adjust_next_delay(state.row_count, settings.buffer_size, settings.refresh_interval)
            }
        };

        let next_query = move |state: QueryState| {
            let idle_count = state.next_idle_count();

            let switch_to_backtracking = settings.backtracking_enabled
                && !state.backtracking
                && !state.latest.is_zero()
                && (idle_count >= settings.backtracking_idle_threshold
                    || state
                        .latest
                        .timestamp
                        .signed_duration_since(state.latest_backtracking.timestamp)
                        > half_backtracking_window);

            let mut next = state;
            if switch_to_backtracking {
                next.backtracking = true;
                if next.latest_backtracking.is_zero() {
                    next.latest_backtracking =
                        TimestampOffset::at(next.latest.timestamp - first_backtracking_window);
                }
                debug!(
                    log_prefix = %log_prefix,
                    from = %next.latest_backtracking.timestamp,
                    "switching to backtracking"
                );
            } else if next.backtracking && next.row_count < settings.buffer_size.saturating_sub(1) {
                // The window was not saturated; backtracking has caught up.
                next.backtracking = false;
                debug!(log_prefix = %log_prefix, "switching from backtracking");
            }
            next.row_count = 0;
            next.query_count += 1;
            next.idle_count = idle_count;

            let from_timestamp = next.next_query_from_timestamp();
            let to_timestamp = next.next_query_to_timestamp(settings.buffer_size);
            let behind_current_time = if next.backtracking {
                settings.backtracking_behind_current_time
            } else {
                settings.behind_current_time
            };

            debug!(
                log_prefix = %log_prefix,
                query_count = next.query_count,
                backtracking = next.backtracking,
                from = %from_timestamp,
                "running live query"
            );

            let query = RowQuery {
                entity_type: entity_type.clone(),
                min_slice,
                max_slice,
                from_timestamp,
                to_timestamp,
                behind_current_time,
                backtracking: next.backtracking,
            };
            let start = next.current_offset().clone();
            let rows = envelope_stream(&dao, &create_envelope, query, &start, settings.buffer_size);
            (next, Some(rows))
        };

        continuous_query(
            QueryState::initial(offset),
            update_state,
            delay_next_query,
            next_query,
            before_query,
        )
    }
}
