use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dispatch_pipeline::{
    clock::{Clock, SystemClock},
    config::{self, BLS_KEY},
    db, routes,
    services::{
        analysis::{AnalysisConfig, AnalysisHandler},
        consumer::ConsumerPool,
        dead_letter_queue::DeadLetterQueue,
        dead_letter_store::DeadLetterStore,
        dispatch_queue::DispatchQueue,
        notifier::{Notifier, Router as EventRouter},
        producer::{HttpSource, KeyTemplate, Producer, ProducerSet, SourceSpec},
        scheduler::Scheduler,
        storage_service::{NotificationTarget, StorageService},
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting dispatch pipeline with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Object store with creation notifications ---
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone()).with_notifications(
        NotificationTarget {
            rule: cfg.notification_rule(),
            sender: events_tx,
        },
    );
    storage.ensure_bucket(&cfg.bucket).await?;

    // --- Dispatch queue + DLQ (persisted in SQLite) ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (dlq_writes_tx, dlq_writes_rx) = mpsc::unbounded_channel();
    let dlq_store = DeadLetterStore::new(db.clone());
    let dlq = Arc::new(
        DeadLetterQueue::new(
            "analysis-dlq",
            chrono::Duration::from_std(cfg.dlq_retention).context("DLQ retention out of range")?,
        )
        .with_persistence(dlq_writes_tx),
    );
    dlq.restore(dlq_store.load().await.context("loading dead letters")?);
    let queue = Arc::new(DispatchQueue::new(
        "analysis",
        cfg.queue_config(),
        dlq,
        clock.clone(),
    ));

    // Stopped last, after everything that can still produce writes or events.
    let persistence_shutdown = CancellationToken::new();
    let persister = tokio::spawn(dlq_store.run(dlq_writes_rx, persistence_shutdown.clone()));
    let notifier_shutdown = CancellationToken::new();
    let notifier = Notifier::new(EventRouter::new(cfg.notification_rule()), queue.clone());
    let notifier = tokio::spawn(notifier.run(events_rx, notifier_shutdown.clone()));

    let shutdown = CancellationToken::new();
    let mut background = tokio::task::JoinSet::new();
    background.spawn(queue.clone().run_sweeper(cfg.sweep_interval, shutdown.clone()));

    // --- Consumers ---
    let handler = Arc::new(AnalysisHandler::new(
        storage.clone(),
        AnalysisConfig {
            bucket: cfg.bucket.clone(),
            bls_key: BLS_KEY.to_string(),
            watched_prefix: cfg.watched_prefix.clone(),
            report_prefix: cfg.report_prefix.clone(),
        },
    ));
    let consumers = ConsumerPool::spawn(
        cfg.consumers,
        queue.clone(),
        handler,
        cfg.consumer_config(),
        shutdown.clone(),
    );

    // --- Producers + scheduler ---
    let producers = Arc::new(ProducerSet::new(vec![
        Producer::new(
            storage.clone(),
            cfg.bucket.clone(),
            Arc::new(HttpSource::new(cfg.population_source_url.clone(), cfg.fetch_timeout)?),
            SourceSpec {
                name: "population".into(),
                key: KeyTemplate::Dated {
                    prefix: cfg.watched_prefix.clone(),
                    extension: ".json".into(),
                },
                content_type: Some("application/json".into()),
                expect_json: true,
                skip_unchanged: false,
            },
            clock.clone(),
        ),
        Producer::new(
            storage.clone(),
            cfg.bucket.clone(),
            Arc::new(HttpSource::new(cfg.bls_source_url.clone(), cfg.fetch_timeout)?),
            SourceSpec {
                name: "bls".into(),
                key: KeyTemplate::Fixed(BLS_KEY.into()),
                content_type: Some("text/tab-separated-values".into()),
                expect_json: false,
                skip_unchanged: true,
            },
            clock.clone(),
        ),
    ]));

    if cfg.scheduler_enabled {
        let scheduler = Scheduler::new(cfg.schedule_period, producers.clone());
        let token = shutdown.clone();
        background.spawn(async move {
            scheduler.run(token).await;
        });
    } else {
        tracing::info!("Scheduler disabled; use POST /producer/run to fetch datasets");
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState {
        storage,
        bucket: cfg.bucket.clone(),
        queue: queue.clone(),
        producers,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    // --- Drain background work ---
    shutdown.cancel();
    let report = consumers.join().await;
    while background.join_next().await.is_some() {}
    notifier_shutdown.cancel();
    let notified = notifier.await.context("notifier task failed")?;
    queue.close();
    persistence_shutdown.cancel();
    persister.await.context("dead-letter persistence task failed")?;
    let stats = queue.stats();
    tracing::info!(
        processed = report.processed,
        failed = report.failed,
        enqueued = notified.enqueued,
        abandoned = notified.abandoned,
        visible = stats.visible,
        in_flight = stats.in_flight,
        dead_letters = stats.dead_letters,
        "Pipeline stopped"
    );

    Ok(())
}
