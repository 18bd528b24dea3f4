//! The capability set a storage backend offers to the data handler.

use crate::coords::DataCoordinates;
use crate::item::Metadata;

/// A storage backend (on-disk writer, in-RAM store, ...).
///
/// The data handler drives `put` from a single writer thread, so backends
/// never see concurrent writes. `get_data`, `get_metadata` and `contains`
/// may be called concurrently with writes and with each other.
pub trait Storage: Send + Sync + 'static {
    /// Persist one item. May block.
    fn put(
        &self,
        coords: &DataCoordinates,
        payload: &[u8],
        metadata: &Metadata,
    ) -> anyhow::Result<()>;

    /// Retrieve a persisted payload.
    fn get_data(&self, coords: &DataCoordinates) -> anyhow::Result<Vec<u8>>;

    /// Retrieve persisted metadata.
    fn get_metadata(&self, coords: &DataCoordinates) -> anyhow::Result<Metadata>;

    /// Whether the coordinates have been persisted.
    fn contains(&self, coords: &DataCoordinates) -> anyhow::Result<bool>;

    /// No further puts will arrive; flush buffered state.
    fn finish(&self) -> anyhow::Result<()>;

    /// Release resources. Called once, after `finish`.
    fn close(&self) -> anyhow::Result<()>;
}
