//! HTTP surface of the pipeline.
//!
//! - `GET  /healthz`, `GET /readyz`
//! - `GET  /objects`: list latest versions (prefix, max-keys, continuation-token)
//! - `PUT  /objects/{*key}`: write a new version (may trigger analysis)
//! - `GET  /objects/{*key}`: read latest, or `?version=N`
//! - `HEAD /objects/{*key}`: latest version headers
//! - `GET  /queue/stats`, `GET /dlq`, `GET /dlq/{id}`
//! - `POST /producer/run`: run the producers now
//!
//! The wildcard `*key` allows nested keys like `population/2024-01-01.json`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, head_object, list_objects, put_object},
        queue_handlers::{get_dead_letter, list_dead_letters, queue_stats, run_producers},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/objects", get(list_objects))
        .route(
            "/objects/{*key}",
            put(put_object).get(get_object).head(head_object),
        )
        .route("/queue/stats", get(queue_stats))
        .route("/dlq", get(list_dead_letters))
        .route("/dlq/{id}", get(get_dead_letter))
        .route("/producer/run", post(run_producers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::services::{
        dead_letter_queue::DeadLetterQueue,
        dispatch_queue::{DispatchQueue, QueueConfig},
        producer::ProducerSet,
        storage_service::StorageService,
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app_with_clock(clock: ManualClock) -> (Router, AppState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(db::connect_in_memory().await.unwrap());
        let storage = StorageService::new(db, dir.path());
        storage.ensure_bucket("pipeline-data").await.unwrap();
        let queue = Arc::new(DispatchQueue::new(
            "analysis",
            QueueConfig::default(),
            Arc::new(DeadLetterQueue::new("analysis-dlq", chrono::Duration::days(14))),
            Arc::new(clock),
        ));
        let state = AppState {
            storage,
            bucket: "pipeline-data".into(),
            queue,
            producers: Arc::new(ProducerSet::new(Vec::new())),
        };
        (routes().with_state(state.clone()), state, dir)
    }

    async fn app() -> (Router, AppState, TempDir) {
        app_with_clock(ManualClock::default()).await
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put(key: &str, body: &'static str) -> Request<Body> {
        Request::put(format!("/objects/{}", key))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_and_readyz_report_ok() {
        let (app, _state, _dir) = app().await;

        let health = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        let body = json_body(ready).await;
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["disk"]["ok"], true);
    }

    #[tokio::test]
    async fn readyz_fails_once_queue_is_closed() {
        let (app, state, _dir) = app().await;
        state.queue.close();

        let ready = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn put_then_get_versions() {
        let (app, _state, _dir) = app().await;

        let first = app.clone().oneshot(put("population/a.json", "[1]")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        assert_eq!(first.headers()["x-object-version"], "1");
        let second = app.clone().oneshot(put("population/a.json", "[2]")).await.unwrap();
        assert_eq!(json_body(second).await["version"], 2);

        let latest = app
            .clone()
            .oneshot(Request::get("/objects/population/a.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
        assert_eq!(latest.headers()[header::CONTENT_TYPE], "application/json");
        let bytes = to_bytes(latest.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"[2]");

        let old = app
            .oneshot(
                Request::get("/objects/population/a.json?version=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(old.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"[1]");
    }

    #[tokio::test]
    async fn missing_object_is_404() {
        let (app, _state, _dir) = app().await;

        let response = app
            .oneshot(Request::get("/objects/population/none.json").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["status"], 404);
    }

    #[tokio::test]
    async fn head_returns_headers_only() {
        let (app, _state, _dir) = app().await;
        app.clone().oneshot(put("bls/pr.data.0.Current", "abc")).await.unwrap();

        let response = app
            .oneshot(
                Request::head("/objects/bls/pr.data.0.Current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "3");
        assert!(response.headers().contains_key(header::ETAG));
    }

    #[tokio::test]
    async fn list_paginates_with_tokens() {
        let (app, _state, _dir) = app().await;
        for key in ["population/a.json", "population/b.json", "population/c.json", "bls/x"] {
            app.clone().oneshot(put(key, "{}")).await.unwrap();
        }

        let page = app
            .clone()
            .oneshot(
                Request::get("/objects?prefix=population/&max-keys=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let page = json_body(page).await;
        assert_eq!(page["key_count"], 2);
        assert_eq!(page["is_truncated"], true);
        let token = page["next_continuation_token"].as_str().unwrap().to_string();

        let rest = app
            .oneshot(
                Request::get(format!(
                    "/objects?prefix=population/&max-keys=2&continuation-token={}",
                    token
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        let rest = json_body(rest).await;
        assert_eq!(rest["key_count"], 1);
        assert_eq!(rest["objects"][0]["key"], "population/c.json");
        assert_eq!(rest["is_truncated"], false);
    }

    #[tokio::test]
    async fn queue_stats_and_dlq_inspection() {
        let clock = ManualClock::default();
        let (app, state, _dir) = app_with_clock(clock.clone()).await;
        let id = state.queue.enqueue("population/poison.json").unwrap();
        for _ in 0..4 {
            state.queue.receive();
            clock.advance(chrono::Duration::seconds(300));
        }

        let stats = app
            .clone()
            .oneshot(Request::get("/queue/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats = json_body(stats).await;
        assert_eq!(stats["dead_letters"], 1);
        assert_eq!(stats["visible"], 0);

        let list = app
            .clone()
            .oneshot(Request::get("/dlq").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(list).await.as_array().unwrap().len(), 1);

        let one = app
            .clone()
            .oneshot(Request::get(format!("/dlq/{}", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(one.status(), StatusCode::OK);
        assert_eq!(json_body(one).await["message"]["receive_count"], 3);

        let missing = app
            .oneshot(
                Request::get(format!("/dlq/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn producer_run_with_no_sources_is_empty() {
        let (app, _state, _dir) = app().await;
        let response = app
            .oneshot(Request::post("/producer/run").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!([]));
    }
}
