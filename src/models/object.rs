//! Represents one immutable version of an object stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a single stored object version.
///
/// Writing the same key again never mutates an existing row; it adds a row
/// with the next `version`. The payload bytes live on disk under `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct StoredObject {
    /// Internal UUID; also names the payload file.
    pub id: Uuid,

    /// Name of the bucket this object belongs to.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Per-key version, starting at 1 and increasing by one per write.
    pub version: i64,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload, lowercase hex.
    pub etag: String,

    /// When this version was written.
    pub created_at: DateTime<Utc>,
}
