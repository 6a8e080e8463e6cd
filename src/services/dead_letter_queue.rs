//! Dead-letter queue: the terminal sink for poison messages.
//!
//! Entries are kept for a bounded retention window for manual inspection.
//! Nothing moves entries back into the dispatch queue. With persistence
//! attached, every change is also sent to a
//! [`DeadLetterStore`](super::dead_letter_store::DeadLetterStore).

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::models::message::{DeadLetter, DeadLetterReason, Message, MessageId};
use crate::services::dead_letter_store::DeadLetterWrite;

pub struct DeadLetterQueue {
    name: String,
    retention: Duration,
    entries: Mutex<VecDeque<DeadLetter>>,
    persistence: Option<mpsc::UnboundedSender<DeadLetterWrite>>,
}

impl DeadLetterQueue {
    pub fn new(name: impl Into<String>, retention: Duration) -> Self {
        Self {
            name: name.into(),
            retention,
            entries: Mutex::new(VecDeque::new()),
            persistence: None,
        }
    }

    /// Send every push and purge to `writes`. Sending never blocks, so
    /// pushes stay safe under the dispatch queue's lock.
    pub fn with_persistence(mut self, writes: mpsc::UnboundedSender<DeadLetterWrite>) -> Self {
        self.persistence = Some(writes);
        self
    }

    /// Reload entries read back from storage. Entries already present are
    /// skipped; the result is ordered by `moved_at`.
    pub fn restore(&self, restored: Vec<DeadLetter>) {
        let mut entries = self.entries.lock();
        let mut added = 0;
        for entry in restored {
            if entries.iter().any(|e| e.message.id == entry.message.id) {
                continue;
            }
            entries.push_back(entry);
            added += 1;
        }
        entries.make_contiguous().sort_by_key(|entry| entry.moved_at);
        info!(dlq = %self.name, restored = added, "dead letters restored");
    }

    fn persist(&self, write: DeadLetterWrite) {
        let Some(writes) = &self.persistence else {
            return;
        };
        if let Err(mpsc::error::SendError(write)) = writes.send(write) {
            error!(
                dlq = %self.name,
                ?write,
                "dead-letter persistence has stopped, change not saved"
            );
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Park `message`. Its receive count is kept exactly as it was.
    pub fn push(&self, message: Message, reason: DeadLetterReason, now: DateTime<Utc>) {
        warn!(
            dlq = %self.name,
            message_id = %message.id,
            payload = %message.payload,
            receive_count = message.receive_count,
            %reason,
            "message moved to dead-letter queue"
        );
        let entry = DeadLetter {
            message,
            moved_at: now,
            reason,
        };
        if self.persistence.is_some() {
            self.persist(DeadLetterWrite::Insert(entry.clone()));
        }
        self.entries.lock().push_back(entry);
    }

    /// Snapshot of all retained entries, oldest first.
    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: MessageId) -> Option<DeadLetter> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.message.id == id)
            .cloned()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.lock().iter().any(|entry| entry.message.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop entries that have outlived the retention window. Returns how
    /// many were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut expired = Vec::new();
        self.entries.lock().retain(|entry| {
            let keep = entry.moved_at > cutoff;
            if !keep {
                expired.push(entry.message.id);
            }
            keep
        });
        let purged = expired.len();
        if purged > 0 {
            info!(dlq = %self.name, purged, "expired dead letters purged");
            self.persist(DeadLetterWrite::Remove(expired));
        }
        purged
    }
}
