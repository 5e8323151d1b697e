use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use slicetail_core::{Timestamp, TimestampOffset};

use crate::error::{StateError, StateResult};
use crate::OffsetStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS offsets (
    projection_id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    read_timestamp TEXT NOT NULL,
    seen TEXT NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
)";

/// SQLite-backed offset store.
pub struct SqliteOffsetStore {
    conn: Mutex<Connection>,
}

impl SqliteOffsetStore {
    /// Open or create an offset store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening offset store");

        let conn = Connection::open(path)?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory offset store (for testing).
    pub fn in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_timestamp(value: &str) -> StateResult<Timestamp> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| StateError::InvalidOffset(format!("{value}: {e}")))
}

fn decode_offset(timestamp: &str, read_timestamp: &str, seen: &str) -> StateResult<TimestampOffset> {
    let seen: HashMap<String, i64> = serde_json::from_str(seen)?;
    Ok(TimestampOffset::new(
        parse_timestamp(timestamp)?,
        parse_timestamp(read_timestamp)?,
        seen,
    ))
}

impl OffsetStore for SqliteOffsetStore {
    fn load_offset(&self, projection_id: &str) -> StateResult<Option<TimestampOffset>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT timestamp, read_timestamp, seen FROM offsets WHERE projection_id = ?1",
        )?;

        let result = stmt.query_row([projection_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        });

        match result {
            Ok((timestamp, read_timestamp, seen)) => {
                decode_offset(&timestamp, &read_timestamp, &seen).map(Some)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_offset(&self, projection_id: &str, offset: &TimestampOffset) -> StateResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO offsets (projection_id, timestamp, read_timestamp, seen, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(projection_id) DO UPDATE SET
                timestamp = ?2,
                read_timestamp = ?3,
                seen = ?4,
                updated_at = CURRENT_TIMESTAMP",
            rusqlite::params![
                projection_id,
                offset.timestamp.to_rfc3339(),
                offset.read_timestamp.to_rfc3339(),
                serde_json::to_string(&offset.seen)?,
            ],
        )?;

        Ok(())
    }

    fn all_offsets(&self) -> StateResult<Vec<(String, TimestampOffset)>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt =
            conn.prepare("SELECT projection_id, timestamp, read_timestamp, seen FROM offsets")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (projection_id, timestamp, read_timestamp, seen) = row?;
            result.push((
                projection_id,
                decode_offset(&timestamp, &read_timestamp, &seen)?,
            ));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use slicetail_core::epoch;

    fn offset_at(seconds: i64, seen: &[(&str, i64)]) -> TimestampOffset {
        TimestampOffset::new(
            epoch() + TimeDelta::seconds(seconds),
            epoch() + TimeDelta::seconds(seconds),
            seen.iter().map(|(id, nr)| (id.to_string(), *nr)).collect(),
        )
    }

    #[test]
    fn test_offset_roundtrip() {
        let store = SqliteOffsetStore::in_memory().unwrap();

        assert!(store.load_offset("projection-1").unwrap().is_none());

        let offset = offset_at(1_700_000_000, &[("p1", 7), ("p2", 3)]);
        store.save_offset("projection-1", &offset).unwrap();

        let loaded = store.load_offset("projection-1").unwrap().unwrap();
        assert_eq!(loaded, offset);
    }

    #[test]
    fn test_offset_update() {
        let store = SqliteOffsetStore::in_memory().unwrap();

        store
            .save_offset("projection-1", &offset_at(100, &[("p1", 1)]))
            .unwrap();
        store
            .save_offset("projection-1", &offset_at(200, &[("p1", 2)]))
            .unwrap();

        let loaded = store.load_offset("projection-1").unwrap().unwrap();
        assert_eq!(loaded.timestamp, epoch() + TimeDelta::seconds(200));
        assert_eq!(loaded.seen, [("p1".to_string(), 2i64)].into_iter().collect());
    }

    #[test]
    fn test_all_offsets_and_min_timestamp() {
        let store = SqliteOffsetStore::in_memory().unwrap();

        assert!(store.min_timestamp().unwrap().is_none());

        store.save_offset("a", &offset_at(300, &[])).unwrap();
        store.save_offset("b", &offset_at(100, &[])).unwrap();
        store.save_offset("c", &offset_at(200, &[])).unwrap();

        assert_eq!(store.all_offsets().unwrap().len(), 3);
        assert_eq!(
            store.min_timestamp().unwrap(),
            Some(epoch() + TimeDelta::seconds(100))
        );
    }

    #[test]
    fn test_empty_seen_map_roundtrip() {
        let store = SqliteOffsetStore::in_memory().unwrap();

        let offset = offset_at(42, &[]);
        store.save_offset("projection-1", &offset).unwrap();

        let loaded = store.load_offset("projection-1").unwrap().unwrap();
        assert!(loaded.seen.is_empty());
    }
}
