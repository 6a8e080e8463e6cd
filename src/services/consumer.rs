//! Analysis consumer harness.
//!
//! A consumer polls the dispatch queue, runs its handler on each delivery and
//! deletes the message only when the handler succeeds. On any failure the
//! message is left alone; its visibility timeout is the retry mechanism.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::message::{DeleteOutcome, Delivery, Message};
use crate::services::dispatch_queue::DispatchQueue;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("referenced object `{0}` is unavailable: {1}")]
    ObjectUnavailable(String, String),
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("processing exceeded {0:?}")]
    TimedOut(Duration),
}

/// Processes one message. Must be safe to run more than once for the same
/// payload, since delivery is at-least-once.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Long-poll wait per receive.
    pub poll_wait: Duration,
    /// Budget for one handler call. Should stay below the queue's visibility
    /// timeout, or a slow success can race a redelivery.
    pub processing_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(20),
            processing_timeout: Duration::from_secs(240),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Deleted,
    /// Succeeded, but the receipt had already lapsed.
    DeletedTooLate,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub processed: u64,
    pub failed: u64,
}

pub struct Consumer {
    id: usize,
    queue: Arc<DispatchQueue>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        id: usize,
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            handler,
            config,
        }
    }

    /// Run the handler for one delivery and settle it.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let message = &delivery.message;
        let result = tokio::time::timeout(
            self.config.processing_timeout,
            self.handler.handle(message),
        )
        .await
        .unwrap_or(Err(ProcessingError::TimedOut(self.config.processing_timeout)));

        match result {
            Ok(()) => match self.queue.delete(&delivery.receipt) {
                DeleteOutcome::Deleted => {
                    info!(
                        consumer = self.id,
                        message_id = %message.id,
                        payload = %message.payload,
                        receive_count = message.receive_count,
                        "message processed"
                    );
                    Outcome::Deleted
                }
                DeleteOutcome::NoOp => {
                    warn!(
                        consumer = self.id,
                        message_id = %message.id,
                        "processed after receipt lapsed, message may be redelivered"
                    );
                    Outcome::DeletedTooLate
                }
            },
            Err(err) => {
                warn!(
                    consumer = self.id,
                    message_id = %message.id,
                    payload = %message.payload,
                    receive_count = message.receive_count,
                    max_receive_count = self.queue.config().max_receive_count,
                    error = %err,
                    "processing failed, leaving message for redelivery"
                );
                Outcome::Failed
            }
        }
    }

    /// Poll and process until `shutdown` is cancelled.
    ///
    /// A delivery in progress at shutdown is abandoned without delete and
    /// reappears once its visibility window lapses.
    pub async fn run(self, shutdown: CancellationToken) -> ConsumerReport {
        info!(consumer = self.id, queue = self.queue.name(), "consumer started");
        let mut report = ConsumerReport::default();

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = self.queue.receive_wait(self.config.poll_wait) => delivery,
            };
            let Some(delivery) = delivery else {
                debug!(consumer = self.id, "no messages");
                continue;
            };

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(
                        consumer = self.id,
                        message_id = %delivery.message.id,
                        "shutdown mid-processing, message left for redelivery"
                    );
                    break;
                }
                outcome = self.process(delivery.clone()) => outcome,
            };
            match outcome {
                Outcome::Deleted | Outcome::DeletedTooLate => report.processed += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        info!(
            consumer = self.id,
            processed = report.processed,
            failed = report.failed,
            "consumer stopped"
        );
        report
    }
}

/// `n` independent consumers on one queue.
pub struct ConsumerPool {
    tasks: JoinSet<ConsumerReport>,
}

impl ConsumerPool {
    pub fn spawn(
        n: usize,
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for id in 0..n {
            let consumer = Consumer::new(id, queue.clone(), handler.clone(), config.clone());
            tasks.spawn(consumer.run(shutdown.clone()));
        }
        Self { tasks }
    }

    /// Wait for every consumer to stop and sum their reports.
    pub async fn join(mut self) -> ConsumerReport {
        let mut total = ConsumerReport::default();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(report) => {
                    total.processed += report.processed;
                    total.failed += report.failed;
                }
                Err(err) => warn!(error = %err, "consumer task panicked"),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::dead_letter_queue::DeadLetterQueue;
    use crate::services::dispatch_queue::QueueConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Fails each payload a set number of times before succeeding.
    struct FailingHandler {
        remaining_failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
    }

    impl FailingHandler {
        fn new(failures: &[(&str, u32)]) -> Arc<Self> {
            Arc::new(Self {
                remaining_failures: Mutex::new(
                    failures.iter().map(|(k, n)| (k.to_string(), *n)).collect(),
                ),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
            self.calls.lock().push(message.payload.clone());
            let mut failures = self.remaining_failures.lock();
            match failures.get_mut(&message.payload) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(ProcessingError::Analysis("boom".into()))
                }
                _ => Ok(()),
            }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _message: &Message) -> Result<(), ProcessingError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn setup() -> (Arc<DispatchQueue>, ManualClock) {
        let clock = ManualClock::default();
        let queue = Arc::new(DispatchQueue::new(
            "analysis",
            QueueConfig::default(),
            Arc::new(DeadLetterQueue::new("analysis-dlq", chrono::Duration::days(14))),
            Arc::new(clock.clone()),
        ));
        (queue, clock)
    }

    fn consumer(queue: &Arc<DispatchQueue>, handler: Arc<dyn MessageHandler>) -> Consumer {
        Consumer::new(
            0,
            queue.clone(),
            handler,
            ConsumerConfig {
                poll_wait: Duration::from_millis(10),
                processing_timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn success_deletes_message() {
        let (queue, clock) = setup();
        let id = queue.enqueue("population/2024-01-01.json").unwrap();
        let consumer = consumer(&queue, FailingHandler::new(&[]));

        let outcome = consumer.process(queue.receive().unwrap()).await;

        assert_eq!(outcome, Outcome::Deleted);
        assert_eq!(queue.message_state(id), None);
        clock.advance(chrono::Duration::seconds(600));
        assert!(queue.receive().is_none());
    }

    #[tokio::test]
    async fn failure_leaves_message_for_redelivery() {
        let (queue, clock) = setup();
        queue.enqueue("population/bad.json").unwrap();
        let handler = FailingHandler::new(&[("population/bad.json", 1)]);
        let consumer = consumer(&queue, handler.clone());

        assert_eq!(consumer.process(queue.receive().unwrap()).await, Outcome::Failed);
        assert!(queue.receive().is_none());

        clock.advance(chrono::Duration::seconds(300));
        let retry = queue.receive().unwrap();
        assert_eq!(retry.message.receive_count, 2);
        assert_eq!(consumer.process(retry).await, Outcome::Deleted);
        assert_eq!(handler.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (queue, _clock) = setup();
        let id = queue.enqueue("population/slow.json").unwrap();
        let consumer = consumer(&queue, Arc::new(SlowHandler));

        assert_eq!(consumer.process(queue.receive().unwrap()).await, Outcome::Failed);
        assert_eq!(
            queue.message_state(id),
            Some(crate::models::message::MessageState::InFlight)
        );
    }

    #[tokio::test]
    async fn poison_message_reaches_dlq_after_three_attempts() {
        let (queue, clock) = setup();
        let id = queue.enqueue("population/poison.json").unwrap();
        let handler = FailingHandler::new(&[("population/poison.json", u32::MAX)]);
        let consumer = consumer(&queue, handler.clone());

        while let Some(delivery) = queue.receive() {
            consumer.process(delivery).await;
            clock.advance(chrono::Duration::seconds(300));
        }

        assert_eq!(handler.calls.lock().len(), 3);
        let dead = queue.dead_letter_queue().get(id).unwrap();
        assert_eq!(dead.message.receive_count, 3);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let (queue, _clock) = setup();
        for i in 0..20 {
            queue.enqueue(format!("population/{}.json", i)).unwrap();
        }
        let handler = FailingHandler::new(&[]);
        let shutdown = CancellationToken::new();
        let pool = ConsumerPool::spawn(
            4,
            queue.clone(),
            handler.clone(),
            ConsumerConfig {
                poll_wait: Duration::from_millis(10),
                processing_timeout: Duration::from_secs(1),
            },
            shutdown.clone(),
        );

        for _ in 0..100 {
            if queue.stats().total_deleted == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        let report = pool.join().await;

        assert_eq!(report.processed, 20);
        assert_eq!(report.failed, 0);
        assert_eq!(handler.calls.lock().len(), 20);
    }
}
