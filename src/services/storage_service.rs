//! src/services/storage_service.rs
//!
//! StorageService: versioned object storage backed by SQLite for metadata and
//! local disk for payloads sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{object_id}`.
//!
//! Every successful write creates a new immutable version and, when the key
//! matches the configured notification rule, publishes exactly one
//! [`NotificationEvent`].

use crate::models::{bucket::Bucket, event::NotificationEvent, object::StoredObject};
use crate::services::notifier::NotificationRule;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::mpsc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OBJECT_COLUMNS: &str = "o.id, b.name AS bucket, o.key, o.version, o.content_type, \
                              o.size_bytes, o.etag, o.created_at";

#[derive(Clone, Debug, Default)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    /// Latest version of every matching key, in key order.
    pub objects: Vec<StoredObject>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("version {version} of object `{key}` not found in bucket `{bucket}`")]
    VersionNotFound {
        bucket: String,
        key: String,
        version: i64,
    },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where creation events go, and which keys produce them.
#[derive(Clone, Debug)]
pub struct NotificationTarget {
    pub rule: NotificationRule,
    pub sender: mpsc::UnboundedSender<NotificationEvent>,
}

/// StorageService provides the object store operations the pipeline needs:
/// - Put an object (atomic write to disk, new version row in SQLite)
/// - Get the latest or a specific version
/// - List the latest versions under a prefix
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    notifications: Option<NotificationTarget>,
}

/// Longest object key the store accepts, in bytes.
pub const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            notifications: None,
        }
    }

    /// Publish an `ObjectCreated` event for every write whose key matches
    /// `target.rule`.
    pub fn with_notifications(mut self, target: NotificationTarget) -> Self {
        self.notifications = Some(target);
        self
    }

    /// Rejects keys that are empty, too long, absolute, contain `..`, or
    /// carry control characters.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format: 3-63 characters of lowercase letters,
    /// digits, dots and hyphens, starting and ending with a letter or digit,
    /// with no consecutive dots.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard directories from MD5(bucket/key), so one key's
    /// versions sit together and no directory grows unbounded.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn payload_path(&self, object: &StoredObject) -> PathBuf {
        self.payload_path_for(&object.bucket, &object.key, object.id)
    }

    fn payload_path_for(&self, bucket_name: &str, key: &str, id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        self.bucket_root(bucket_name)
            .join(shard_a)
            .join(shard_b)
            .join(id.to_string())
    }

    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
                other => StorageError::Sqlx(other),
            })
    }

    /// Return the named bucket, creating it (and its directory) if missing.
    pub async fn ensure_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        sqlx::query(
            "INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        self.fetch_bucket(name).await
    }

    async fn fetch_latest(&self, bucket: &Bucket, key: &str) -> StorageResult<StoredObject> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects o JOIN buckets b ON b.id = o.bucket_id
             WHERE o.bucket_id = ? AND o.key = ?
             ORDER BY o.version DESC LIMIT 1"
        );
        sqlx::query_as::<_, StoredObject>(&sql)
            .bind(bucket.id)
            .bind(key)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            })
    }

    async fn fetch_version(
        &self,
        bucket: &Bucket,
        key: &str,
        version: i64,
    ) -> StorageResult<StoredObject> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects o JOIN buckets b ON b.id = o.bucket_id
             WHERE o.bucket_id = ? AND o.key = ? AND o.version = ?"
        );
        sqlx::query_as::<_, StoredObject>(&sql)
            .bind(bucket.id)
            .bind(key)
            .bind(version)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
                version,
            })
    }

    /// Write `body` as the next version of `key`.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        body: Bytes,
    ) -> StorageResult<StoredObject> {
        let stream = stream::once(async move { Ok::<_, io::Error>(body) });
        self.upload_object_stream(bucket, key, content_type, stream)
            .await
    }

    /// Stream-upload a new object version.
    ///
    /// - Writes bytes incrementally to a temporary file, computing MD5/etag
    ///   and size as they arrive.
    /// - fsyncs and renames the file into its final location.
    /// - Inserts the version row; the version number is assigned inside the
    ///   same statement so concurrent writers never collide.
    /// - Publishes the creation event only after the row is committed.
    ///
    /// On any failure the payload is removed and no event is published.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let id = Uuid::new_v4();
        let file_path = self.payload_path_for(&bucket_rec.name, key, id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = write_payload(&tmp_path, stream).await;
        let (size_bytes, etag) = match written {
            Ok(summary) => summary,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let created_at = Utc::now();
        let insert_result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, version, content_type, size_bytes, etag, created_at
            ) VALUES (
                ?, ?, ?,
                (SELECT COALESCE(MAX(version), 0) + 1 FROM objects WHERE bucket_id = ? AND key = ?),
                ?, ?, ?, ?
            )
            RETURNING version
            "#,
        )
        .bind(id)
        .bind(bucket_rec.id)
        .bind(key)
        .bind(bucket_rec.id)
        .bind(key)
        .bind(content_type.clone())
        .bind(size_bytes)
        .bind(&etag)
        .bind(created_at)
        .fetch_one(&*self.db)
        .await;

        let version = match insert_result {
            Ok(version) => version,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let object = StoredObject {
            id,
            bucket: bucket_rec.name,
            key: key.to_string(),
            version,
            content_type,
            size_bytes,
            etag,
            created_at,
        };
        debug!(key = %object.key, version, size_bytes, "stored object version");

        self.publish_created(&object);
        Ok(object)
    }

    fn publish_created(&self, object: &StoredObject) {
        let Some(target) = &self.notifications else {
            return;
        };
        if !target.rule.matches(&object.key) {
            debug!(key = %object.key, "key outside notification rule, no event");
            return;
        }
        let event = NotificationEvent::object_created(object);
        match target.sender.send(event) {
            Ok(()) => info!(key = %object.key, version = object.version, "published ObjectCreated"),
            Err(_) => warn!(
                key = %object.key,
                version = object.version,
                "notification channel closed, ObjectCreated not delivered"
            ),
        }
    }

    /// Latest version metadata and payload bytes.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(StoredObject, Bytes)> {
        let object = self.head_object(bucket, key).await?;
        let bytes = self.read_payload(&object).await?;
        Ok((object, bytes))
    }

    /// A specific version's metadata and payload bytes.
    pub async fn get_object_version(
        &self,
        bucket: &str,
        key: &str,
        version: i64,
    ) -> StorageResult<(StoredObject, Bytes)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_version(&bucket_rec, key, version).await?;
        let bytes = self.read_payload(&object).await?;
        Ok((object, bytes))
    }

    /// Metadata plus an open file handle, for streaming responses.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
        version: Option<i64>,
    ) -> StorageResult<(StoredObject, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = match version {
            Some(version) => self.fetch_version(&bucket_rec, key, version).await?,
            None => self.fetch_latest(&bucket_rec, key).await?,
        };

        let file = File::open(self.payload_path(&object))
            .await
            .map_err(|err| self.missing_payload(&object, err))?;
        Ok((object, file))
    }

    /// Latest version metadata only.
    pub async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_latest(&bucket_rec, key).await
    }

    async fn read_payload(&self, object: &StoredObject) -> StorageResult<Bytes> {
        fs::read(self.payload_path(object))
            .await
            .map(Bytes::from)
            .map_err(|err| self.missing_payload(object, err))
    }

    fn missing_payload(&self, object: &StoredObject, err: io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::ObjectNotFound {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            }
        } else {
            StorageError::Io(err)
        }
    }

    /// List the latest version of each key, in lexicographic key order.
    ///
    /// `continuation_token` is the last key of the previous page.
    pub async fn list_objects(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> StorageResult<ListObjectsResult> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects o JOIN buckets b ON b.id = o.bucket_id \
             WHERE o.version = (SELECT MAX(version) FROM objects latest \
             WHERE latest.bucket_id = o.bucket_id AND latest.key = o.key) \
             AND o.bucket_id = "
        ));
        builder.push_bind(bucket_rec.id);

        if let Some(prefix) = &params.prefix {
            builder.push(" AND substr(o.key, 1, length(");
            builder.push_bind(prefix.clone());
            builder.push(")) = ");
            builder.push_bind(prefix.clone());
        }

        if let Some(token) = &params.continuation_token {
            builder.push(" AND o.key > ");
            builder.push_bind(token.clone());
        }

        builder.push(" ORDER BY o.key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut objects: Vec<StoredObject> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_continuation_token = None;
        if objects.len() == fetch_limit {
            objects.pop();
            next_continuation_token = objects.last().map(|obj| obj.key.clone());
            is_truncated = true;
        }

        Ok(ListObjectsResult {
            objects,
            is_truncated,
            next_continuation_token,
        })
    }
}

/// Copy `stream` into a new file at `path`, returning size and MD5 hex.
async fn write_payload<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();

    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((size_bytes, format!("{:x}", digest.compute())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn service() -> (StorageService, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_in_memory().await.unwrap();
        let service = StorageService::new(Arc::new(pool), dir.path());
        service.ensure_bucket("pipeline-data").await.unwrap();
        (service, dir)
    }

    #[tokio::test]
    async fn put_assigns_increasing_versions() {
        let (service, _dir) = service().await;

        let first = service
            .put_object("pipeline-data", "population/a.json", None, Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = service
            .put_object("pipeline-data", "population/a.json", None, Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.etag, format!("{:x}", md5::compute(b"two")));

        let (latest, bytes) = service
            .get_object("pipeline-data", "population/a.json")
            .await
            .unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(&bytes[..], b"two");

        let (old, bytes) = service
            .get_object_version("pipeline-data", "population/a.json", 1)
            .await
            .unwrap();
        assert_eq!(old.id, first.id);
        assert_eq!(&bytes[..], b"one");
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let (service, _dir) = service().await;

        let err = service
            .get_object("pipeline-data", "population/missing.json")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_object() {
        let (service, dir) = service().await;
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::BrokenPipe, "source hung up")),
        ]);

        let err = service
            .upload_object_stream("pipeline-data", "population/broken.json", None, body)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Io(_)));
        assert!(matches!(
            service.head_object("pipeline-data", "population/broken.json").await,
            Err(StorageError::ObjectNotFound { .. })
        ));

        let leftovers: Vec<_> = walk_files(dir.path());
        assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
    }

    #[tokio::test]
    async fn publishes_only_for_matching_keys() {
        let (service, _dir) = service().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = service.with_notifications(NotificationTarget {
            rule: NotificationRule::prefix("population/"),
            sender: tx,
        });

        service
            .put_object("pipeline-data", "bls/pr.data.0.Current", None, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let stored = service
            .put_object(
                "pipeline-data",
                "population/2024-01-01.json",
                None,
                Bytes::from_static(b"[]"),
            )
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "population/2024-01-01.json");
        assert_eq!(event.version, stored.version);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_unsafe_keys_and_bucket_names() {
        let (service, _dir) = service().await;

        for key in ["", "/abs", "a/../b", "tab\tkey"] {
            let err = service
                .put_object("pipeline-data", key, None, Bytes::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey), "key {:?}", key);
        }

        let err = service.ensure_bucket("Bad_Bucket").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidBucketName { .. }));
    }

    #[tokio::test]
    async fn lists_latest_versions_with_pagination() {
        let (service, _dir) = service().await;
        for key in ["population/a.json", "population/b.json", "population/c.json", "bls/x"] {
            service
                .put_object("pipeline-data", key, None, Bytes::from_static(b"v1"))
                .await
                .unwrap();
        }
        service
            .put_object("pipeline-data", "population/a.json", None, Bytes::from_static(b"v2"))
            .await
            .unwrap();

        let page = service
            .list_objects(
                "pipeline-data",
                ListObjectsParams {
                    prefix: Some("population/".into()),
                    continuation_token: None,
                    max_keys: 2,
                },
            )
            .await
            .unwrap();

        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["population/a.json", "population/b.json"]);
        assert_eq!(page.objects[0].version, 2);
        assert!(page.is_truncated);

        let rest = service
            .list_objects(
                "pipeline-data",
                ListObjectsParams {
                    prefix: Some("population/".into()),
                    continuation_token: page.next_continuation_token,
                    max_keys: 2,
                },
            )
            .await
            .unwrap();
        let keys: Vec<_> = rest.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["population/c.json"]);
        assert!(!rest.is_truncated);
    }

    fn walk_files(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }
}
