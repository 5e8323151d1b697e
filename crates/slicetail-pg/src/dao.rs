//! Postgres implementation of the query DAO.
//!
//! Serves bounded time-window queries over a journal table indexed by
//! `(entity_type, slice, db_timestamp)`. Every row query selects the
//! transaction timestamp alongside the rows so readers can tell how far
//! behind the database clock they run.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};

use slicetail_core::{Bucket, SerializedRow, Timestamp, BUCKET_DURATION_SECONDS};
use slicetail_query::{DaoError, QueryDao, RowQuery, RowStream};

use crate::error::{PgError, PgResult};

/// Configuration for the Postgres DAO.
#[derive(Debug, Clone)]
pub struct PgDaoConfig {
    /// Postgres connection string.
    pub connection_string: String,
    /// Journal table name.
    pub table: String,
    /// Maximum rows returned per window query.
    pub row_limit: usize,
    /// Set when the table is updated in place (durable state), so that
    /// bucket counts for past windows can still change.
    pub counts_may_change: bool,
}

impl Default for PgDaoConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            table: "event_journal".to_string(),
            row_limit: 1000,
            counts_may_change: false,
        }
    }
}

/// Postgres-backed [`QueryDao`].
pub struct PgQueryDao {
    client: Arc<Client>,
    config: PgDaoConfig,
}

impl PgQueryDao {
    /// Connect and spawn the connection task.
    pub async fn connect(config: PgDaoConfig) -> PgResult<Self> {
        info!(table = %config.table, "Connecting query DAO");

        let (client, connection) = tokio_postgres::connect(&config.connection_string, NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {}", e);
            }
        });

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    /// Create the journal table and its by-slice index if missing.
    pub async fn create_journal_table(&self) -> PgResult<()> {
        let table = &self.config.table;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                slice INT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                seq_nr BIGINT NOT NULL,
                db_timestamp TIMESTAMPTZ NOT NULL DEFAULT transaction_timestamp(),
                payload BYTEA,
                PRIMARY KEY (entity_id, seq_nr)
            )"
        );
        self.client.batch_execute(&ddl).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_slice_idx
             ON {table} (entity_type, slice, db_timestamp)"
        );
        self.client.batch_execute(&index).await?;

        info!(table = %table, "Journal table ready");
        Ok(())
    }
}

fn rows_sql(table: &str, bounded: bool, behind_millis: u128, limit: usize) -> String {
    let mut sql = format!(
        "SELECT entity_id, seq_nr, db_timestamp, transaction_timestamp() AS read_db_timestamp, payload
         FROM {table}
         WHERE entity_type = $1 AND slice BETWEEN $2 AND $3 AND db_timestamp >= $4"
    );
    if bounded {
        sql.push_str(" AND db_timestamp <= $5");
    }
    if behind_millis > 0 {
        sql.push_str(&format!(
            " AND db_timestamp <= transaction_timestamp() - interval '{behind_millis} milliseconds'"
        ));
    }
    sql.push_str(&format!(
        " ORDER BY db_timestamp, entity_id, seq_nr LIMIT {limit}"
    ));
    sql
}

fn buckets_sql(table: &str, limit: usize) -> String {
    format!(
        "SELECT extract(epoch FROM db_timestamp)::bigint / {BUCKET_DURATION_SECONDS} AS bucket, count(*) AS events
         FROM {table}
         WHERE entity_type = $1 AND slice BETWEEN $2 AND $3 AND db_timestamp >= $4
         GROUP BY bucket ORDER BY bucket LIMIT {limit}"
    )
}

fn decode_row(row: &Row) -> PgResult<SerializedRow> {
    Ok(SerializedRow {
        entity_id: row.try_get(0)?,
        seq_nr: row.try_get(1)?,
        db_timestamp: row.try_get::<_, DateTime<Utc>>(2)?,
        read_db_timestamp: row.try_get::<_, DateTime<Utc>>(3)?,
        payload: row.try_get(4)?,
    })
}

async fn fetch_rows(
    client: &Client,
    table: &str,
    row_limit: usize,
    query: &RowQuery,
) -> PgResult<Vec<SerializedRow>> {
    let sql = rows_sql(
        table,
        query.to_timestamp.is_some(),
        query.behind_current_time.as_millis(),
        row_limit,
    );

    let min_slice = i32::from(query.min_slice);
    let max_slice = i32::from(query.max_slice);
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![
        &query.entity_type,
        &min_slice,
        &max_slice,
        &query.from_timestamp,
    ];
    if let Some(to_timestamp) = query.to_timestamp.as_ref() {
        params.push(to_timestamp);
    }

    let rows = client.query(&sql, &params).await?;
    rows.iter().map(decode_row).collect()
}

impl QueryDao for PgQueryDao {
    fn current_db_timestamp(&self) -> impl Future<Output = Result<Timestamp, DaoError>> + Send {
        let client = self.client.clone();
        async move {
            let fetch = async {
                let row = client.query_one("SELECT transaction_timestamp()", &[]).await?;
                let now: DateTime<Utc> = row.try_get(0)?;
                Ok::<_, PgError>(now)
            };
            fetch.await.map_err(DaoError::from)
        }
    }

    fn rows_by_slices(&self, query: RowQuery) -> RowStream {
        let client = self.client.clone();
        let table = self.config.table.clone();
        let row_limit = self.config.row_limit;

        let fetch = async move {
            fetch_rows(&client, &table, row_limit, &query)
                .await
                .map_err(DaoError::from)
        };
        stream::once(fetch)
            .map(|result| match result {
                Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
                Err(e) => stream::once(std::future::ready(Err(e))).boxed(),
            })
            .flatten()
            .boxed()
    }

    fn count_buckets_may_change(&self) -> bool {
        self.config.counts_may_change
    }

    fn count_buckets(
        &self,
        entity_type: &str,
        min_slice: u16,
        max_slice: u16,
        from: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Bucket>, DaoError>> + Send {
        let client = self.client.clone();
        let sql = buckets_sql(&self.config.table, limit);
        let entity_type = entity_type.to_string();
        let min_slice = i32::from(min_slice);
        let max_slice = i32::from(max_slice);

        async move {
            let fetch = async {
                let rows = client
                    .query(&sql, &[&entity_type, &min_slice, &max_slice, &from])
                    .await?;
                let mut buckets = Vec::with_capacity(rows.len());
                for row in &rows {
                    let bucket: i64 = row.try_get(0)?;
                    let count: i64 = row.try_get(1)?;
                    buckets.push(Bucket::new(bucket * BUCKET_DURATION_SECONDS, count));
                }
                Ok::<_, PgError>(buckets)
            };
            fetch.await.map_err(DaoError::from)
        }
    }
}
