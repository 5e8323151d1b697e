//! End-to-end behavior of the finite (current) by-slice query.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures::StreamExt;

use slicetail_core::{
    Bucket, Error as CoreError, EventEnvelope, ManualClock, QuerySettings, SerializedRow,
    Timestamp, TimestampOffset,
};
use slicetail_query::{BySliceQuery, MockDao, QueryError};

fn t0() -> Timestamp {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

fn row(entity_id: &str, seq_nr: i64, millis: i64) -> SerializedRow {
    SerializedRow {
        entity_id: entity_id.to_string(),
        seq_nr,
        db_timestamp: t0() + TimeDelta::milliseconds(millis),
        read_db_timestamp: t0() + TimeDelta::milliseconds(millis),
        payload: Some(vec![0xAB]),
    }
}

fn queries(dao: &MockDao, settings: QuerySettings) -> BySliceQuery<MockDao, EventEnvelope> {
    BySliceQuery::new(
        Arc::new(dao.clone()),
        Arc::new(EventEnvelope::from_row),
        Arc::new(EventEnvelope::offset),
        settings,
        Arc::new(ManualClock::new(t0())),
    )
}

#[tokio::test]
async fn test_emits_all_rows_then_confirms_and_terminates() {
    let dao = MockDao::new();
    dao.set_current_db_timestamp(t0() + TimeDelta::seconds(60));
    dao.push_batch(vec![row("p1", 1, 0), row("p1", 2, 1), row("p1", 3, 2)]);

    let envelopes: Vec<EventEnvelope> = queries(&dao, QuerySettings::default())
        .current_by_slices("test", "Account", 0, 255, None)
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[2].seq_nr, 3);
    assert_eq!(
        envelopes[2].offset.seen,
        [("p1".to_string(), 3i64)].into_iter().collect()
    );

    // One data query, one empty query, one empty confirmation query.
    let issued = dao.queries();
    assert_eq!(issued.len(), 3);
    assert!(issued.iter().all(|q| !q.backtracking));
    assert!(issued.iter().all(|q| q.behind_current_time == Duration::ZERO));
    assert_eq!(issued[1].from_timestamp, t0() + TimeDelta::milliseconds(2));
    assert_eq!(issued[2].from_timestamp, t0() + TimeDelta::milliseconds(2));
    assert_eq!(dao.current_db_timestamp_calls(), 1);
}

#[tokio::test]
async fn test_empty_journal_terminates_after_confirmation() {
    let dao = MockDao::new();
    dao.set_current_db_timestamp(t0());

    let envelopes: Vec<_> = queries(&dao, QuerySettings::default())
        .current_by_slices("test", "Account", 0, 255, None)
        .collect()
        .await;

    assert!(envelopes.is_empty());
    assert_eq!(dao.queries().len(), 2);
}

#[tokio::test]
async fn test_upper_bound_clamped_to_initial_db_time() {
    let dao = MockDao::new();
    let db_time = t0() + TimeDelta::seconds(5);
    dao.set_current_db_timestamp(db_time);
    let t0_seconds = t0().timestamp();
    dao.set_buckets(vec![
        Bucket::new(t0_seconds, 3),
        Bucket::new(t0_seconds + 10, 5),
        Bucket::new(t0_seconds + 20, 7),
    ]);

    let settings = QuerySettings {
        buffer_size: 10,
        ..QuerySettings::default()
    };
    let envelopes: Vec<_> = queries(&dao, settings)
        .current_by_slices("test", "Account", 0, 255, None)
        .collect()
        .await;
    assert!(envelopes.is_empty());

    // The histogram answers 30s past the cursor, but the clamp wins.
    let issued = dao.queries();
    assert!(!issued.is_empty());
    assert!(issued.iter().all(|q| q.to_timestamp == Some(db_time)));

    // The fetched histogram was fresh and adequate, so it is fetched once.
    assert_eq!(dao.bucket_queries().len(), 1);
}

#[tokio::test]
async fn test_resume_from_offset_suppresses_already_seen_rows() {
    let dao = MockDao::new();
    dao.set_current_db_timestamp(t0() + TimeDelta::seconds(60));
    dao.push_batch(vec![
        row("p1", 1, 0),
        row("p1", 2, 0),
        row("p2", 1, 0),
        row("p1", 3, 1),
    ]);

    let offset = TimestampOffset::new(
        t0(),
        t0(),
        [("p1".to_string(), 2i64)].into_iter().collect(),
    );
    let envelopes: Vec<EventEnvelope> = queries(&dao, QuerySettings::default())
        .current_by_slices("test", "Account", 0, 255, Some(offset))
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].entity_id, "p2");
    assert_eq!(
        envelopes[0].offset.seen,
        [("p1".to_string(), 2i64), ("p2".to_string(), 1i64)]
            .into_iter()
            .collect()
    );
    assert_eq!(envelopes[1].entity_id, "p1");
    assert_eq!(envelopes[1].seq_nr, 3);

    assert_eq!(dao.queries()[0].from_timestamp, t0());
}

#[tokio::test]
async fn test_dao_failure_surfaces_once_and_ends_stream() {
    let dao = MockDao::failing("connection refused");

    let items: Vec<_> = queries(&dao, QuerySettings::default())
        .current_by_slices("test", "Account", 0, 255, None)
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(QueryError::Dao(_))));
}

#[tokio::test]
async fn test_misordered_rows_fail_the_stream() {
    let dao = MockDao::new();
    dao.set_current_db_timestamp(t0() + TimeDelta::seconds(60));
    // The DAO sort contract is violated: the second row steps back in time.
    dao.push_batch(vec![row("p1", 2, 5000), row("p2", 1, 0)]);

    let items: Vec<_> = queries(&dao, QuerySettings::default())
        .current_by_slices("test", "Account", 0, 255, None)
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(
        items[1],
        Err(QueryError::Ordering(CoreError::OutOfOrderEvent { mode: "forward", .. }))
    ));
}
