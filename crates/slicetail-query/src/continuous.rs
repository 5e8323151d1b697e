//! Pull-loop skeleton shared by the current and live by-slice queries.
//!
//! One inner stream is consumed at a time. When it completes, the loop
//! pauses per the pacing function, lets `before_query` replace the state,
//! asks `next_query` for the next inner stream, and keeps pulling until
//! `next_query` declines. Dropping the outer stream drops whatever is in
//! flight, inner stream and pending futures alike.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::QueryError;

/// Run a continuous query as a single-threaded cooperative pull loop.
///
/// * `update_state` runs once per emitted value; an error fails the stream.
/// * `delay_next_query` is consulted when an inner stream completes, before
///   `next_query` resets per-query counters, so pacing sees the finished
///   query's state.
/// * `before_query` may replace the state asynchronously before each query.
/// * `next_query` produces the next inner stream, or ends the outer stream
///   by returning `None`.
pub fn continuous_query<S, T>(
    initial_state: S,
    update_state: impl FnMut(&S, &T) -> Result<S, QueryError> + Send + 'static,
    delay_next_query: impl Fn(&S) -> Option<Duration> + Send + 'static,
    next_query: impl FnMut(S) -> (S, Option<BoxStream<'static, Result<T, QueryError>>>) + Send + 'static,
    before_query: impl FnMut(&S) -> Option<BoxFuture<'static, Result<S, QueryError>>> + Send + 'static,
) -> impl Stream<Item = Result<T, QueryError>> + Send + 'static
where
    S: Send + Sync + 'static,
    T: Send + 'static,
{
    struct Ctx<S, T, US, DQ, NQ, BQ> {
        state: Option<S>,
        current: Option<BoxStream<'static, Result<T, QueryError>>>,
        started: bool,
        failed: bool,
        update_state: US,
        delay_next_query: DQ,
        next_query: NQ,
        before_query: BQ,
    }

    let ctx = Ctx {
        state: Some(initial_state),
        current: None,
        started: false,
        failed: false,
        update_state,
        delay_next_query,
        next_query,
        before_query,
    };

    stream::unfold(ctx, |mut ctx| async move {
        loop {
            if ctx.failed {
                return None;
            }

            if let Some(current) = ctx.current.as_mut() {
                match current.next().await {
                    Some(Ok(item)) => {
                        let Some(state) = ctx.state.as_ref() else {
                            return None;
                        };
                        match (ctx.update_state)(state, &item) {
                            Ok(next) => {
                                ctx.state = Some(next);
                                return Some((Ok(item), ctx));
                            }
                            Err(e) => {
                                ctx.failed = true;
                                return Some((Err(e), ctx));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        ctx.failed = true;
                        return Some((Err(e), ctx));
                    }
                    None => {
                        ctx.current = None;
                    }
                }
            } else {
                let Some(state) = ctx.state.as_ref() else {
                    return None;
                };

                // Pace against the just-completed query. The first query runs
                // immediately.
                if ctx.started {
                    if let Some(delay) = (ctx.delay_next_query)(state) {
                        tokio::time::sleep(delay).await;
                    }
                }
                ctx.started = true;

                if let Some(refresh) = (ctx.before_query)(state) {
                    match refresh.await {
                        Ok(state) => ctx.state = Some(state),
                        Err(e) => {
                            ctx.failed = true;
                            return Some((Err(e), ctx));
                        }
                    }
                }

                let Some(state) = ctx.state.take() else {
                    return None;
                };
                let (state, next) = (ctx.next_query)(state);
                ctx.state = Some(state);
                match next {
                    Some(stream) => ctx.current = Some(stream),
                    None => return None,
                }
            }
        }
    })
}

/// Monotonic mapping from the last query's row count to the pause before the
/// next one: a full buffer keeps querying immediately, at least half a buffer
/// halves the refresh interval, anything less sleeps the whole interval.
pub fn adjust_next_delay(
    row_count: usize,
    buffer_size: usize,
    refresh_interval: Duration,
) -> Option<Duration> {
    if row_count >= buffer_size.saturating_sub(1) {
        None
    } else if row_count >= buffer_size / 2 {
        Some(refresh_interval / 2)
    } else {
        Some(refresh_interval)
    }
}
