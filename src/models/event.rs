//! Object-store notification events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::object::StoredObject;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    ObjectCreated,
}

/// Emitted by the object store once per qualifying write. Never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NotificationEvent {
    pub event_type: EventType,
    pub bucket: String,
    pub key: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn object_created(object: &StoredObject) -> Self {
        Self {
            event_type: EventType::ObjectCreated,
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            version: object.version,
            timestamp: object.created_at,
        }
    }
}
