//! Broadcast notifications published by events, the executor, and the data
//! pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::coords::DataCoordinates;

/// Kind identifiers for the notifications the core itself emits.
///
/// The set of kinds is open: event catalogs add their own identifiers and
/// filter on them with [`NotificationFilter::Kind`].
pub mod kinds {
    /// Terminal notification published once per structured event.
    pub const EVENT_EXECUTED: &str = "EventExecuted";
    /// A data item was persisted by a storage backend.
    pub const DATA_STORED: &str = "DataStored";
    /// A storage backend failed to persist an item.
    pub const STORAGE_FAILED: &str = "StorageFailed";
}

/// Coarse notification category, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    /// Event lifecycle (execution, progress).
    Event,
    /// Data availability.
    Data,
    /// Storage backend activity.
    Storage,
    /// Device state changes.
    Device,
}

/// An immutable broadcast message.
///
/// Serializes to the observability wire format
/// `{timestamp_ns, category, kind, description, payload}`.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Creation time; serialized as integer nanoseconds since the epoch.
    #[serde(rename = "timestamp_ns", serialize_with = "timestamp_ns")]
    pub timestamp: DateTime<Utc>,
    /// Coarse category.
    pub category: NotificationCategory,
    /// Concrete subtype identifier.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn timestamp_ns<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    let ns = ts.timestamp_nanos_opt().unwrap_or_default();
    serializer.serialize_u64(u64::try_from(ns).unwrap_or_default())
}

impl Notification {
    /// Build a notification stamped with the current time.
    pub fn new(
        category: NotificationCategory,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            kind: kind.into(),
            description: description.into(),
            payload: None,
        }
    }

    /// Attach a structured payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The terminal notification for a structured event; `error` is the
    /// failure message when execution failed.
    pub fn event_executed(error: Option<&str>) -> Self {
        let n = Self::new(
            NotificationCategory::Event,
            kinds::EVENT_EXECUTED,
            match error {
                Some(_) => "event execution failed",
                None => "event execution finished",
            },
        );
        match error {
            Some(msg) => n.with_payload(serde_json::Value::String(msg.to_string())),
            None => n,
        }
    }

    /// A data item reached its storage backend.
    pub fn data_stored(coords: &DataCoordinates) -> Self {
        Self::new(
            NotificationCategory::Data,
            kinds::DATA_STORED,
            format!("stored {coords}"),
        )
        .with_payload(coords.to_json())
    }

    /// A storage backend rejected an item.
    pub fn storage_failed(coords: &DataCoordinates, error: &anyhow::Error) -> Self {
        Self::new(
            NotificationCategory::Storage,
            kinds::STORAGE_FAILED,
            format!("failed to store {coords}"),
        )
        .with_payload(serde_json::json!({
            "coords": coords.to_json(),
            "error": format!("{error:#}"),
        }))
    }
}

/// Subscription filter over the notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationFilter {
    /// Deliver everything.
    All,
    /// Deliver one category.
    Category(NotificationCategory),
    /// Deliver one concrete kind.
    Kind(String),
}

impl NotificationFilter {
    /// Whether `notification` passes this filter.
    pub fn matches(&self, notification: &Notification) -> bool {
        match self {
            NotificationFilter::All => true,
            NotificationFilter::Category(category) => notification.category == *category,
            NotificationFilter::Kind(kind) => notification.kind == *kind,
        }
    }
}
