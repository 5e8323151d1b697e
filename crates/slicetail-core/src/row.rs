use crate::offset::{Timestamp, TimestampOffset};

/// Raw record produced by the DAO for one persisted event or durable-state
/// change.
///
/// Within one query response, rows ascend by
/// `(db_timestamp, entity_id, seq_nr)`; the driver relies on that ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedRow {
    pub entity_id: String,
    pub seq_nr: i64,
    /// Commit timestamp assigned by the database.
    pub db_timestamp: Timestamp,
    /// Database clock at read time. Diagnostic only.
    pub read_db_timestamp: Timestamp,
    /// Opaque serialized payload. Absent for deleted durable state.
    pub payload: Option<Vec<u8>>,
}

/// Ready-made envelope pairing an offset with the row it was derived from.
///
/// The by-slice query is generic over the envelope type so embedders can use
/// their own; this one serves the CLI and the tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub offset: TimestampOffset,
    pub entity_id: String,
    pub seq_nr: i64,
    pub payload: Option<Vec<u8>>,
}

impl EventEnvelope {
    pub fn from_row(offset: TimestampOffset, row: SerializedRow) -> Self {
        Self {
            offset,
            entity_id: row.entity_id,
            seq_nr: row.seq_nr,
            payload: row.payload,
        }
    }

    pub fn offset(&self) -> &TimestampOffset {
        &self.offset
    }
}
