use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{pin_mut, Stream, StreamExt};
use tracing::info;

use slicetail_core::{EventEnvelope, QuerySettings, SystemClock, TimestampOffset};
use slicetail_pg::{PgDaoConfig, PgQueryDao};
use slicetail_query::{BySliceQuery, QueryError};
use slicetail_state::{OffsetStore, SqliteOffsetStore};

use crate::{JournalArgs, OffsetArgs};

/// Create the journal table and index.
pub async fn run_setup(journal: JournalArgs) -> Result<()> {
    let dao = connect(&journal).await?;
    dao.create_journal_table()
        .await
        .context("Failed to create journal table")?;
    Ok(())
}

/// Read everything committed so far and print it as JSON lines.
pub async fn run_dump(journal: JournalArgs, offsets: OffsetArgs) -> Result<()> {
    let dao = Arc::new(connect(&journal).await?);
    let (store, offset) = open_offset_store(&offsets)?;

    let queries = build_queries(dao, settings_for(&journal, QuerySettings::default()));
    let stream = queries.current_by_slices(
        "dump",
        &journal.entity_type,
        journal.min_slice,
        journal.max_slice,
        offset,
    );

    let emitted = consume(stream, store.as_ref(), &offsets.projection).await?;
    info!(emitted, "Dump complete");
    Ok(())
}

/// Follow the journal continuously.
pub async fn run_tail(
    journal: JournalArgs,
    offsets: OffsetArgs,
    refresh_interval: Duration,
    backtracking_enabled: bool,
) -> Result<()> {
    let dao = Arc::new(connect(&journal).await?);
    let (store, offset) = open_offset_store(&offsets)?;

    let settings = QuerySettings {
        refresh_interval,
        backtracking_enabled,
        ..QuerySettings::default()
    };
    info!(
        entity_type = %journal.entity_type,
        min_slice = journal.min_slice,
        max_slice = journal.max_slice,
        "Tailing journal"
    );

    let queries = build_queries(dao, settings_for(&journal, settings));
    let stream = queries.live_by_slices(
        "tail",
        &journal.entity_type,
        journal.min_slice,
        journal.max_slice,
        offset,
    );

    consume(stream, store.as_ref(), &offsets.projection).await?;
    Ok(())
}

async fn connect(journal: &JournalArgs) -> Result<PgQueryDao> {
    let config = PgDaoConfig {
        connection_string: journal.url.clone(),
        table: journal.table.clone(),
        row_limit: journal.buffer_size,
        ..PgDaoConfig::default()
    };
    PgQueryDao::connect(config)
        .await
        .context("Failed to connect to Postgres")
}

fn settings_for(journal: &JournalArgs, base: QuerySettings) -> QuerySettings {
    QuerySettings {
        buffer_size: journal.buffer_size,
        ..base
    }
}

fn build_queries(
    dao: Arc<PgQueryDao>,
    settings: QuerySettings,
) -> BySliceQuery<PgQueryDao, EventEnvelope> {
    BySliceQuery::new(
        dao,
        Arc::new(EventEnvelope::from_row),
        Arc::new(EventEnvelope::offset),
        settings,
        Arc::new(SystemClock),
    )
}

fn open_offset_store(
    offsets: &OffsetArgs,
) -> Result<(Option<SqliteOffsetStore>, Option<TimestampOffset>)> {
    let store = offsets
        .state
        .as_ref()
        .map(SqliteOffsetStore::open)
        .transpose()
        .context("Failed to open offset store")?;

    let offset = match &store {
        Some(store) => store
            .load_offset(&offsets.projection)
            .context("Failed to load offset")?,
        None => None,
    };
    if let Some(offset) = &offset {
        info!(timestamp = %offset.timestamp, "Resuming from stored offset");
    }

    Ok((store, offset))
}

async fn consume(
    stream: impl Stream<Item = Result<EventEnvelope, QueryError>>,
    store: Option<&SqliteOffsetStore>,
    projection_id: &str,
) -> Result<u64> {
    pin_mut!(stream);

    let mut emitted: u64 = 0;
    while let Some(item) = stream.next().await {
        let envelope = item.context("Event stream failed")?;
        println!("{}", render(&envelope));
        emitted += 1;

        if let Some(store) = store {
            store
                .save_offset(projection_id, &envelope.offset)
                .context("Failed to save offset")?;
        }
    }

    Ok(emitted)
}

fn render(envelope: &EventEnvelope) -> String {
    let payload = envelope
        .payload
        .as_ref()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
    serde_json::json!({
        "timestamp": envelope.offset.timestamp.to_rfc3339(),
        "entity_id": envelope.entity_id,
        "seq_nr": envelope.seq_nr,
        "payload": payload,
    })
    .to_string()
}
