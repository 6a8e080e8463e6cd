//! Routes object-store creation events into the dispatch queue.
//!
//! [`Router`] is a pure filter. [`Notifier`] drives it from the store's
//! notification channel and keeps retrying an enqueue until it succeeds, so
//! a routed event is never dropped while the pipeline is running.

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::event::{EventType, NotificationEvent};
use crate::models::message::MessageId;
use crate::services::dispatch_queue::{DispatchQueue, QueueError};

/// Key filter shared by the object store (which events to emit) and the
/// router (which events to enqueue).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl NotificationRule {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: String::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.prefix) && key.ends_with(&self.suffix)
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    rule: NotificationRule,
}

impl Router {
    pub fn new(rule: NotificationRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> &NotificationRule {
        &self.rule
    }

    /// The message payload for `event`, or `None` when it should not be queued.
    pub fn route(&self, event: &NotificationEvent) -> Option<String> {
        match event.event_type {
            EventType::ObjectCreated if self.rule.matches(&event.key) => Some(event.key.clone()),
            _ => None,
        }
    }
}

/// Anything the notifier can hand a payload to.
pub trait MessageSink: Send + Sync {
    fn enqueue(&self, payload: String) -> Result<MessageId, QueueError>;
}

impl MessageSink for DispatchQueue {
    fn enqueue(&self, payload: String) -> Result<MessageId, QueueError> {
        DispatchQueue::enqueue(self, payload)
    }
}

/// Exponential backoff for failed enqueues.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

pub struct Notifier {
    router: Router,
    sink: Arc<dyn MessageSink>,
    backoff: RetryBackoff,
}

impl Notifier {
    pub fn new(router: Router, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            router,
            sink,
            backoff: RetryBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Route and enqueue one event, retrying until the sink accepts it.
    ///
    /// Returns `None` when the event is filtered out, when its payload can
    /// never fit in a message, or when `shutdown` fires before the enqueue
    /// succeeds. The last two are logged at error level.
    pub async fn deliver(
        &self,
        event: &NotificationEvent,
        shutdown: &CancellationToken,
    ) -> Option<MessageId> {
        let Some(payload) = self.router.route(event) else {
            debug!(key = %event.key, "event does not match notification rule");
            return None;
        };

        let mut delay = self.backoff.initial;
        let mut attempt: u32 = 1;
        loop {
            match self.sink.enqueue(payload.clone()) {
                Ok(id) => {
                    info!(message_id = %id, key = %payload, attempt, "event enqueued for analysis");
                    return Some(id);
                }
                Err(err @ QueueError::MessageTooLarge { .. }) => {
                    error!(key = %payload, error = %err, "event can never be enqueued, skipping");
                    return None;
                }
                Err(err) => {
                    warn!(
                        key = %payload,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "enqueue failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    error!(key = %payload, attempt, "shutdown before event could be enqueued");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.backoff.max);
            attempt += 1;
        }
    }

    /// Consume events until the channel closes or `shutdown` fires.
    ///
    /// On shutdown, events still buffered in the channel get one enqueue
    /// attempt each; any that fail are logged at error level with their key.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<NotificationEvent>,
        shutdown: CancellationToken,
    ) -> NotifierReport {
        info!(prefix = %self.router.rule().prefix, "notifier started");
        let mut report = NotifierReport::default();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if self.deliver(&event, &shutdown).await.is_some() {
                report.enqueued += 1;
            }
        }

        events.close();
        while let Ok(event) = events.try_recv() {
            match self.deliver_once(&event) {
                Ok(Some(_)) => report.enqueued += 1,
                Ok(None) => {}
                Err(err) => {
                    error!(key = %event.key, error = %err, "event abandoned at shutdown");
                    report.abandoned += 1;
                }
            }
        }
        info!(enqueued = report.enqueued, abandoned = report.abandoned, "notifier stopped");
        report
    }

    /// Single enqueue attempt, used while draining at shutdown.
    fn deliver_once(&self, event: &NotificationEvent) -> Result<Option<MessageId>, QueueError> {
        let Some(payload) = self.router.route(event) else {
            return Ok(None);
        };
        let id = self.sink.enqueue(payload)?;
        info!(message_id = %id, key = %event.key, "buffered event enqueued at shutdown");
        Ok(Some(id))
    }
}

/// What a notifier did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierReport {
    pub enqueued: u64,
    /// Buffered events that could not be enqueued before exit.
    pub abandoned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::services::dead_letter_queue::DeadLetterQueue;
    use crate::services::dispatch_queue::QueueConfig;
    use chrono::Utc;
    use parking_lot::Mutex;

    fn created(key: &str) -> NotificationEvent {
        NotificationEvent {
            event_type: EventType::ObjectCreated,
            bucket: "pipeline-data".into(),
            key: key.into(),
            version: 1,
            timestamp: Utc::now(),
        }
    }

    fn queue() -> Arc<DispatchQueue> {
        queue_with(QueueConfig::default())
    }

    fn queue_with(config: QueueConfig) -> Arc<DispatchQueue> {
        Arc::new(DispatchQueue::new(
            "analysis",
            config,
            Arc::new(DeadLetterQueue::new("analysis-dlq", chrono::Duration::days(14))),
            Arc::new(SystemClock),
        ))
    }

    fn population_router() -> Router {
        Router::new(NotificationRule::prefix("population/"))
    }

    /// Fails the first `failures` enqueues.
    struct FlakySink {
        failures: Mutex<u32>,
        accepted: Mutex<Vec<String>>,
    }

    impl MessageSink for FlakySink {
        fn enqueue(&self, payload: String) -> Result<MessageId, QueueError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(QueueError::Closed("analysis".into()));
            }
            self.accepted.lock().push(payload);
            Ok(MessageId::new())
        }
    }

    #[test]
    fn rule_matches_prefix_and_suffix() {
        let rule = NotificationRule::prefix("population/").with_suffix(".json");
        assert!(rule.matches("population/2024-01-01.json"));
        assert!(!rule.matches("population/2024-01-01.csv"));
        assert!(!rule.matches("bls/pr.data.0.Current"));
        assert!(NotificationRule::default().matches("anything"));
    }

    #[test]
    fn router_uses_key_as_payload() {
        let router = Router::new(NotificationRule::prefix("population/"));
        assert_eq!(
            router.route(&created("population/2024-01-01.json")),
            Some("population/2024-01-01.json".to_string())
        );
        assert_eq!(router.route(&created("reports/x.json")), None);
    }

    #[tokio::test]
    async fn deliver_enqueues_fresh_message() {
        let queue = queue();
        let notifier = Notifier::new(population_router(), queue.clone());

        let id = notifier
            .deliver(&created("population/2024-01-01.json"), &CancellationToken::new())
            .await
            .unwrap();

        let delivery = queue.receive().unwrap();
        assert_eq!(delivery.message.id, id);
        assert_eq!(delivery.message.payload, "population/2024-01-01.json");
        assert_eq!(delivery.message.receive_count, 1);
    }

    #[tokio::test]
    async fn deliver_retries_until_enqueue_succeeds() {
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(3),
            accepted: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::new(population_router(), sink.clone())
            .with_backoff(RetryBackoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
            });

        let id = notifier
            .deliver(&created("population/a.json"), &CancellationToken::new())
            .await;

        assert!(id.is_some());
        assert_eq!(*sink.failures.lock(), 0);
        assert_eq!(*sink.accepted.lock(), vec!["population/a.json".to_string()]);
    }

    #[tokio::test]
    async fn deliver_gives_up_only_on_shutdown() {
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(u32::MAX),
            accepted: Mutex::new(Vec::new()),
        });
        let notifier = Notifier::new(population_router(), sink.clone())
            .with_backoff(RetryBackoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(2),
            });
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let id = notifier.deliver(&created("population/a.json"), &shutdown).await;

        assert!(id.is_none());
        assert!(*sink.failures.lock() < u32::MAX - 2);
        assert!(sink.accepted.lock().is_empty());
    }

    #[tokio::test]
    async fn run_drains_channel_and_filters() {
        let queue = queue();
        let notifier = Notifier::new(population_router(), queue.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(created("population/a.json")).unwrap();
        tx.send(created("bls/pr.data.0.Current")).unwrap();
        tx.send(created("population/b.json")).unwrap();
        drop(tx);

        notifier.run(rx, CancellationToken::new()).await;

        let payloads: Vec<_> = queue
            .receive_batch(10)
            .into_iter()
            .map(|d| d.message.payload)
            .collect();
        assert_eq!(payloads, ["population/a.json", "population/b.json"]);
    }

    #[tokio::test]
    async fn run_flushes_buffered_events_on_shutdown() {
        let queue = queue();
        let notifier = Notifier::new(population_router(), queue.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        for key in ["population/a.json", "population/b.json", "population/c.json"] {
            tx.send(created(key)).unwrap();
        }
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = notifier.run(rx, shutdown).await;

        assert_eq!(report, NotifierReport { enqueued: 3, abandoned: 0 });
        assert_eq!(queue.receive_batch(10).len(), 3);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn run_reports_events_it_cannot_flush() {
        let queue = queue();
        queue.close();
        let notifier = Notifier::new(population_router(), queue.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(created("population/a.json")).unwrap();
        tx.send(created("bls/pr.data.0.Current")).unwrap();
        tx.send(created("population/b.json")).unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = notifier.run(rx, shutdown).await;

        assert_eq!(report, NotifierReport { enqueued: 0, abandoned: 2 });
    }

    #[tokio::test]
    async fn oversized_event_is_skipped_and_later_events_flow() {
        let queue = queue_with(QueueConfig {
            max_message_bytes: 20,
            ..QueueConfig::default()
        });
        let notifier = Notifier::new(population_router(), queue.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let long_key = format!("population/{}.json", "x".repeat(64));
        tx.send(created(&long_key)).unwrap();
        tx.send(created("population/a.json")).unwrap();
        drop(tx);

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            notifier.run(rx, CancellationToken::new()),
        )
        .await
        .expect("notifier stalled on an oversized event");

        assert_eq!(report.enqueued, 1);
        let payloads: Vec<_> = queue
            .receive_batch(10)
            .into_iter()
            .map(|d| d.message.payload)
            .collect();
        assert_eq!(payloads, ["population/a.json"]);
    }
}
