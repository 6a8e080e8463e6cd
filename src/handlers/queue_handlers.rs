//! Operational endpoints for the dispatch queue, its DLQ and the producers.

use crate::{
    errors::AppError,
    models::message::{DeadLetter, MessageId},
    services::{dispatch_queue::QueueStats, producer::ProduceOutcome},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use uuid::Uuid;

/// `GET /queue/stats`
pub async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

/// `GET /dlq`: every dead letter, oldest first.
pub async fn list_dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.queue.dead_letter_queue().list())
}

/// `GET /dlq/{id}`
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeadLetter>, AppError> {
    state
        .queue
        .dead_letter_queue()
        .get(MessageId::from_uuid(id))
        .map(Json)
        .ok_or_else(|| {
            AppError::not_found(format!("message {} is not in the dead-letter queue", id))
        })
}

#[derive(Debug, Serialize)]
pub struct ProducerRunResult {
    pub source: String,
    pub status: &'static str,
    pub key: Option<String>,
    pub version: Option<i64>,
    pub error: Option<String>,
}

/// `POST /producer/run`: run every producer once, outside the schedule.
pub async fn run_producers(State(state): State<AppState>) -> Json<Vec<ProducerRunResult>> {
    tracing::info!(sources = state.producers.len(), "manual producer run requested");
    let results = state.producers.run_all().await;

    let body = state
        .producers
        .names()
        .into_iter()
        .zip(results)
        .map(|(name, result)| {
            let source = name.to_string();
            match result {
                Ok(ProduceOutcome::Stored(object)) => ProducerRunResult {
                    source,
                    status: "stored",
                    key: Some(object.key),
                    version: Some(object.version),
                    error: None,
                },
                Ok(ProduceOutcome::Unchanged { key, version }) => ProducerRunResult {
                    source,
                    status: "unchanged",
                    key: Some(key),
                    version: Some(version),
                    error: None,
                },
                Err(err) => ProducerRunResult {
                    source,
                    status: "failed",
                    key: None,
                    version: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .collect();
    Json(body)
}
