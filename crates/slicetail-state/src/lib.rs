mod error;
mod sqlite;

pub use error::{StateError, StateResult};
pub use sqlite::SqliteOffsetStore;

use slicetail_core::{Timestamp, TimestampOffset};

/// Trait for offset storage backends used by downstream projections.
///
/// A projection that restarts from a stored offset relies on the offset's
/// `seen` map to drop events at the same timestamp it already applied, so
/// the store must persist the map verbatim.
pub trait OffsetStore: Send + Sync {
    /// Get the stored offset for a projection.
    fn load_offset(&self, projection_id: &str) -> StateResult<Option<TimestampOffset>>;

    /// Save the offset for a projection.
    fn save_offset(&self, projection_id: &str, offset: &TimestampOffset) -> StateResult<()>;

    /// Get all stored offsets.
    fn all_offsets(&self) -> StateResult<Vec<(String, TimestampOffset)>>;

    /// Earliest stored timestamp across projections (safe restart point).
    fn min_timestamp(&self) -> StateResult<Option<Timestamp>> {
        let offsets = self.all_offsets()?;
        Ok(offsets.iter().map(|(_, offset)| offset.timestamp).min())
    }
}
