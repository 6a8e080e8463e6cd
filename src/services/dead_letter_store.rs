//! SQLite persistence for the dead-letter queue.
//!
//! The in-memory [`DeadLetterQueue`](super::dead_letter_queue::DeadLetterQueue)
//! is written behind: it emits a [`DeadLetterWrite`] per change and
//! [`DeadLetterStore::run`] applies them in order. On startup the table is
//! loaded back so retention survives a restart.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::message::{DeadLetter, DeadLetterReason, Message, MessageId};

#[derive(Debug, Error)]
pub enum DeadLetterStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("unreadable dead-letter reason: {0}")]
    Reason(#[from] serde_json::Error),
    #[error("stored receive count {0} is out of range")]
    ReceiveCount(i64),
}

/// One change to the persisted dead letters.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterWrite {
    Insert(DeadLetter),
    Remove(Vec<MessageId>),
}

#[derive(FromRow)]
struct DeadLetterRow {
    message_id: Uuid,
    payload: String,
    receive_count: i64,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    moved_at: DateTime<Utc>,
    reason: String,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = DeadLetterStoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let receive_count = u32::try_from(row.receive_count)
            .map_err(|_| DeadLetterStoreError::ReceiveCount(row.receive_count))?;
        Ok(DeadLetter {
            message: Message {
                id: MessageId::from_uuid(row.message_id),
                payload: row.payload,
                receive_count,
                enqueued_at: row.enqueued_at,
                visible_at: row.visible_at,
            },
            moved_at: row.moved_at,
            reason: serde_json::from_str::<DeadLetterReason>(&row.reason)?,
        })
    }
}

#[derive(Clone)]
pub struct DeadLetterStore {
    db: Arc<SqlitePool>,
}

impl DeadLetterStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Every persisted dead letter, oldest move first.
    pub async fn load(&self) -> Result<Vec<DeadLetter>, DeadLetterStoreError> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT message_id, payload, receive_count, enqueued_at, visible_at, moved_at, reason
             FROM dead_letters ORDER BY moved_at, rowid",
        )
        .fetch_all(&*self.db)
        .await?;
        rows.into_iter().map(DeadLetter::try_from).collect()
    }

    pub async fn insert(&self, entry: &DeadLetter) -> Result<(), DeadLetterStoreError> {
        let reason = serde_json::to_string(&entry.reason)?;
        sqlx::query(
            "INSERT INTO dead_letters
             (message_id, payload, receive_count, enqueued_at, visible_at, moved_at, reason)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(entry.message.id.as_uuid())
        .bind(entry.message.payload.as_str())
        .bind(i64::from(entry.message.receive_count))
        .bind(entry.message.enqueued_at)
        .bind(entry.message.visible_at)
        .bind(entry.moved_at)
        .bind(reason)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, ids: &[MessageId]) -> Result<u64, DeadLetterStoreError> {
        let mut tx = self.db.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM dead_letters WHERE message_id = ?")
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn apply(&self, write: DeadLetterWrite) {
        match write {
            DeadLetterWrite::Insert(entry) => {
                let id = entry.message.id;
                match self.insert(&entry).await {
                    Ok(()) => debug!(message_id = %id, "dead letter persisted"),
                    Err(err) => error!(
                        message_id = %id,
                        payload = %entry.message.payload,
                        error = %err,
                        "failed to persist dead letter"
                    ),
                }
            }
            DeadLetterWrite::Remove(ids) => match self.remove(&ids).await {
                Ok(removed) => debug!(removed, "expired dead letters removed from database"),
                Err(err) => error!(
                    count = ids.len(),
                    error = %err,
                    "failed to remove dead letters"
                ),
            },
        }
    }

    /// Apply writes until `shutdown` fires or every sender is gone, then
    /// apply whatever is still buffered.
    pub async fn run(
        self,
        mut writes: mpsc::UnboundedReceiver<DeadLetterWrite>,
        shutdown: CancellationToken,
    ) {
        info!("dead-letter persistence started");
        loop {
            let write = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                write = writes.recv() => match write {
                    Some(write) => write,
                    None => break,
                },
            };
            self.apply(write).await;
        }

        writes.close();
        while let Ok(write) = writes.try_recv() {
            self.apply(write).await;
        }
        info!("dead-letter persistence stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::services::dead_letter_queue::DeadLetterQueue;
    use chrono::{Duration, TimeZone};

    const REASON: DeadLetterReason = DeadLetterReason::MaxReceiveCountExceeded {
        max_receive_count: 3,
    };

    fn message(payload: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            payload: payload.to_string(),
            receive_count: 3,
            enqueued_at: at,
            visible_at: at + Duration::minutes(15),
        }
    }

    async fn file_pool(dir: &tempfile::TempDir) -> Arc<SqlitePool> {
        let url = format!("sqlite://{}", dir.path().join("pipeline.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        Arc::new(pool)
    }

    #[tokio::test]
    async fn dead_letters_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let pool = file_pool(&dir).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let dlq = DeadLetterQueue::new("analysis-dlq", Duration::days(14)).with_persistence(tx);
        dlq.push(message("population/a.json", start), REASON, start);
        dlq.push(message("population/b.json", start), REASON, start + Duration::hours(1));
        let before = dlq.list();
        drop(dlq);
        DeadLetterStore::new(pool.clone())
            .run(rx, CancellationToken::new())
            .await;
        pool.close().await;

        let reopened = file_pool(&dir).await;
        let loaded = DeadLetterStore::new(reopened).load().await.unwrap();
        assert_eq!(loaded, before);

        let restored = DeadLetterQueue::new("analysis-dlq", Duration::days(14));
        restored.restore(loaded);
        assert_eq!(restored.list(), before);
        assert_eq!(restored.get(before[0].message.id).unwrap().message.receive_count, 3);
    }

    #[tokio::test]
    async fn retention_purge_removes_rows() {
        let pool = Arc::new(db::connect_in_memory().await.unwrap());
        let store = DeadLetterStore::new(pool);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let dlq = DeadLetterQueue::new("analysis-dlq", Duration::days(14)).with_persistence(tx);
        dlq.push(message("old", start), REASON, start);
        dlq.push(message("new", start), REASON, start + Duration::days(10));
        assert_eq!(dlq.purge_expired(start + Duration::days(15)), 1);
        drop(dlq);
        store.clone().run(rx, CancellationToken::new()).await;

        let rows = store.load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message.payload, "new");
    }

    #[tokio::test]
    async fn buffered_writes_are_applied_after_shutdown() {
        let store = DeadLetterStore::new(Arc::new(db::connect_in_memory().await.unwrap()));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let dlq = DeadLetterQueue::new("analysis-dlq", Duration::days(14)).with_persistence(tx);
        dlq.push(message("population/a.json", now), REASON, now);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        store.clone().run(rx, shutdown).await;

        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_ignored() {
        let store = DeadLetterStore::new(Arc::new(db::connect_in_memory().await.unwrap()));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = DeadLetter {
            message: message("population/a.json", now),
            moved_at: now,
            reason: REASON,
        };

        store.insert(&entry).await.unwrap();
        store.insert(&entry).await.unwrap();

        assert_eq!(store.load().await.unwrap(), vec![entry]);
    }
}
