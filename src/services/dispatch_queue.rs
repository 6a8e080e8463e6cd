//! src/services/dispatch_queue.rs
//!
//! At-least-once dispatch queue with visibility timeouts and receive-count
//! redrive into a [`DeadLetterQueue`].
//!
//! Per message: `Visible -> InFlight -> (deleted | Visible again | DLQ)`.
//! `receive_count` is incremented when a message is received, so it counts
//! attempts started. An in-flight message whose window lapses goes back to
//! `Visible` unless it has already been received `max_receive_count` times,
//! in which case it moves to the DLQ instead.
//!
//! The whole message table sits behind one mutex, so `receive`, `delete`,
//! `change_visibility` and `tick` are atomic with respect to each other.
//! Lapsed windows are swept lazily on every receive and periodically by
//! [`DispatchQueue::run_sweeper`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::models::message::{
    DeadLetterReason, DeleteOutcome, Delivery, Message, MessageId, MessageState, ReceiptHandle,
};
use crate::services::dead_letter_queue::DeadLetterQueue;

/// Longest visibility window a message can be given.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest a single long-poll receive may wait.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("queue `{0}` is closed")]
    Closed(String),
    #[error("message is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    MessageTooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },
    #[error("receipt for message {0} is no longer valid")]
    ReceiptExpired(MessageId),
    #[error("visibility timeout of {0:?} exceeds the 12 hour maximum")]
    VisibilityTimeoutTooLong(Duration),
    #[error("max receive count must be at least 1")]
    ZeroMaxReceiveCount,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub max_message_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 3,
            max_message_bytes: 256 * 1024,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.visibility_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(QueueError::VisibilityTimeoutTooLong(self.visibility_timeout));
        }
        if self.max_receive_count == 0 {
            return Err(QueueError::ZeroMaxReceiveCount);
        }
        Ok(())
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub returned: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub visible: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
    pub total_enqueued: u64,
    pub total_received: u64,
    pub total_deleted: u64,
    pub total_dead_lettered: u64,
}

struct Entry {
    message: Message,
    state: MessageState,
    /// The only receipt that may delete this message. `None` while visible.
    receipt: Option<ReceiptHandle>,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    received: u64,
    deleted: u64,
    dead_lettered: u64,
}

#[derive(Default)]
struct QueueState {
    /// Keyed by arrival sequence, so iteration is oldest first.
    entries: BTreeMap<u64, Entry>,
    index: HashMap<MessageId, u64>,
    next_seq: u64,
    closed: bool,
    counters: Counters,
}

impl QueueState {
    fn entry_mut(&mut self, id: MessageId) -> Option<(u64, &mut Entry)> {
        let seq = *self.index.get(&id)?;
        self.entries.get_mut(&seq).map(|entry| (seq, entry))
    }

    fn remove(&mut self, seq: u64) -> Option<Entry> {
        let entry = self.entries.remove(&seq)?;
        self.index.remove(&entry.message.id);
        Some(entry)
    }
}

pub struct DispatchQueue {
    name: String,
    config: QueueConfig,
    visibility_timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
    dlq: Arc<DeadLetterQueue>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl DispatchQueue {
    /// The visibility timeout is capped at [`MAX_VISIBILITY_TIMEOUT`] and a
    /// zero `max_receive_count` is treated as 1; call
    /// [`QueueConfig::validate`] first to reject such configs instead.
    pub fn new(
        name: impl Into<String>,
        mut config: QueueConfig,
        dlq: Arc<DeadLetterQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        config.max_receive_count = config.max_receive_count.max(1);
        let visibility_timeout = to_chrono(config.visibility_timeout);
        Self {
            name: name.into(),
            config,
            visibility_timeout,
            clock,
            dlq,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dead_letter_queue(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Add a message pointing at `payload` with `receive_count = 0`.
    pub fn enqueue(&self, payload: impl Into<String>) -> Result<MessageId, QueueError> {
        let payload = payload.into();
        if payload.len() > self.config.max_message_bytes {
            return Err(QueueError::MessageTooLarge {
                size_bytes: payload.len(),
                limit_bytes: self.config.max_message_bytes,
            });
        }

        let now = self.clock.now();
        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(self.name.clone()));
            }
            let id = MessageId::new();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.index.insert(id, seq);
            state.entries.insert(
                seq,
                Entry {
                    message: Message {
                        id,
                        payload,
                        receive_count: 0,
                        enqueued_at: now,
                        visible_at: now,
                    },
                    state: MessageState::Visible,
                    receipt: None,
                },
            );
            state.counters.enqueued += 1;
            id
        };

        debug!(queue = %self.name, message_id = %id, "message enqueued");
        self.available.notify_waiters();
        Ok(id)
    }

    /// Receive the oldest visible message, if any. Never blocks.
    pub fn receive(&self) -> Option<Delivery> {
        self.receive_batch(1).pop()
    }

    /// Receive up to `max` visible messages, oldest first.
    pub fn receive_batch(&self, max: usize) -> Vec<Delivery> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let report = self.sweep(&mut state, now);

        let visible_at = now + self.visibility_timeout;
        let mut deliveries = Vec::new();
        for entry in state.entries.values_mut() {
            if deliveries.len() >= max {
                break;
            }
            if entry.state != MessageState::Visible {
                continue;
            }
            let receipt = ReceiptHandle::issue(entry.message.id);
            entry.state = MessageState::InFlight;
            entry.message.receive_count += 1;
            entry.message.visible_at = visible_at;
            entry.receipt = Some(receipt);
            deliveries.push(Delivery {
                message: entry.message.clone(),
                receipt,
            });
        }
        state.counters.received += deliveries.len() as u64;
        drop(state);

        for delivery in &deliveries {
            debug!(
                queue = %self.name,
                message_id = %delivery.message.id,
                receive_count = delivery.message.receive_count,
                "message received"
            );
        }
        if report.returned > 0 {
            self.available.notify_waiters();
        }
        deliveries
    }

    /// Long-poll: wait up to `wait` (capped at [`MAX_POLL_WAIT`]) for a
    /// message. `Duration::ZERO` is a short poll.
    pub async fn receive_wait(&self, wait: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + wait.min(MAX_POLL_WAIT);
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.receive() {
                return Some(delivery);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let mut sleep_for = deadline - now;
            if let Some(until_next) = self.time_to_next_lapse() {
                sleep_for = sleep_for.min(until_next);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Delete the message held under `receipt`.
    ///
    /// Lapsed windows are swept first, so a receipt whose window has run out
    /// no longer owns the message. Anything other than the current holder's
    /// receipt is a no-op: the message was already deleted, moved to the
    /// DLQ, or its window lapsed.
    pub fn delete(&self, receipt: &ReceiptHandle) -> DeleteOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if self.sweep(&mut state, now).returned > 0 {
            self.available.notify_waiters();
        }
        let Some((seq, entry)) = state.entry_mut(receipt.message_id) else {
            return DeleteOutcome::NoOp;
        };
        if entry.state != MessageState::InFlight || entry.receipt.as_ref() != Some(receipt) {
            return DeleteOutcome::NoOp;
        }
        state.remove(seq);
        state.counters.deleted += 1;
        drop(state);

        debug!(queue = %self.name, message_id = %receipt.message_id, "message deleted");
        DeleteOutcome::Deleted
    }

    /// Reset the visibility window of the message held under `receipt` to
    /// `timeout` from now. A zero timeout releases it immediately.
    pub fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(QueueError::VisibilityTimeoutTooLong(timeout));
        }
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let Some((_, entry)) = state.entry_mut(receipt.message_id) else {
                return Err(QueueError::ReceiptExpired(receipt.message_id));
            };
            if entry.state != MessageState::InFlight || entry.receipt.as_ref() != Some(receipt) {
                return Err(QueueError::ReceiptExpired(receipt.message_id));
            }
            entry.message.visible_at = now + to_chrono(timeout);
        }
        if timeout.is_zero() {
            self.available.notify_waiters();
        }
        Ok(())
    }

    /// Expire lapsed visibility windows now.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let report = {
            let mut state = self.state.lock();
            self.sweep(&mut state, now)
        };
        if report.returned > 0 {
            self.available.notify_waiters();
        }
        report
    }

    fn sweep(&self, state: &mut QueueState, now: DateTime<Utc>) -> TickReport {
        let max_receive_count = self.config.max_receive_count;
        let mut report = TickReport::default();
        let mut exhausted = Vec::new();

        for (seq, entry) in state.entries.iter_mut() {
            if entry.state != MessageState::InFlight || entry.message.visible_at > now {
                continue;
            }
            entry.receipt = None;
            if entry.message.receive_count >= max_receive_count {
                exhausted.push(*seq);
            } else {
                entry.state = MessageState::Visible;
                report.returned += 1;
            }
        }

        for seq in exhausted {
            if let Some(entry) = state.remove(seq) {
                self.dlq.push(
                    entry.message,
                    DeadLetterReason::MaxReceiveCountExceeded { max_receive_count },
                    now,
                );
                report.dead_lettered += 1;
            }
        }
        state.counters.dead_lettered += report.dead_lettered as u64;

        if report.returned > 0 {
            debug!(
                queue = %self.name,
                returned = report.returned,
                "visibility lapsed, messages visible again"
            );
        }
        report
    }

    /// Real time until the earliest in-flight window lapses.
    fn time_to_next_lapse(&self) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|entry| entry.state == MessageState::InFlight)
            .map(|entry| entry.message.visible_at)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let in_flight = state
            .entries
            .values()
            .filter(|entry| entry.state == MessageState::InFlight)
            .count();
        QueueStats {
            name: self.name.clone(),
            visible: state.entries.len() - in_flight,
            in_flight,
            dead_letters: self.dlq.len(),
            total_enqueued: state.counters.enqueued,
            total_received: state.counters.received,
            total_deleted: state.counters.deleted,
            total_dead_lettered: state.counters.dead_lettered,
        }
    }

    /// Current state of a message still in the queue.
    pub fn message_state(&self, id: MessageId) -> Option<MessageState> {
        let state = self.state.lock();
        let seq = state.index.get(&id)?;
        state.entries.get(seq).map(|entry| entry.state)
    }

    /// Reject further enqueues. Messages already queued can still be
    /// received and deleted.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
        info!(queue = %self.name, "queue closed to new messages");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sweep lapsed windows and expired dead letters every `interval` until
    /// `shutdown` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            queue = %self.name,
            interval_ms = interval.as_millis() as u64,
            "visibility sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick();
                    if report.dead_lettered > 0 {
                        info!(
                            queue = %self.name,
                            returned = report.returned,
                            dead_lettered = report.dead_lettered,
                            "sweep moved messages"
                        );
                    }
                    self.dlq.purge_expired(self.clock.now());
                }
            }
        }
        info!(queue = %self.name, "visibility sweeper stopped");
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_VISIBILITY_TIMEOUT))
        .unwrap_or_else(|_| chrono::Duration::zero())
}
