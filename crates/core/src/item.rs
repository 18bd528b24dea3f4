//! Data items flowing from producing events to storage.

use serde::{Deserialize, Serialize};

use crate::coords::DataCoordinates;

/// JSON-compatible per-item metadata.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One acquired datum: coordinates, an opaque payload, and metadata.
///
/// Items are immutable once submitted to a data handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    /// Where in the acquisition space this item belongs.
    pub coords: DataCoordinates,
    /// Opaque payload bytes (typically an image buffer).
    pub payload: Vec<u8>,
    /// JSON-compatible metadata recorded with the payload.
    pub metadata: Metadata,
}

impl DataItem {
    /// Assemble an item.
    pub fn new(coords: DataCoordinates, payload: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            coords,
            payload,
            metadata,
        }
    }
}
