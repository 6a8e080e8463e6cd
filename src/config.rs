use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

use crate::services::{
    consumer::ConsumerConfig,
    dispatch_queue::{MAX_POLL_WAIT, QueueConfig},
    notifier::NotificationRule,
    storage_service::MAX_OBJECT_KEY_LEN,
};

/// Fixed key the BLS producer writes to.
pub const BLS_KEY: &str = "bls/pr.data.0.Current";

/// Centralized application configuration.
/// Combines `PIPELINE_*` environment variables and CLI arguments; CLI wins.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub watched_prefix: String,
    pub report_prefix: String,
    pub population_source_url: String,
    pub bls_source_url: String,
    pub schedule_period: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub dlq_retention: Duration,
    pub max_message_bytes: usize,
    pub consumers: usize,
    pub poll_wait: Duration,
    pub processing_timeout: Duration,
    pub sweep_interval: Duration,
    pub fetch_timeout: Duration,
    pub scheduler_enabled: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Event-driven dataset ingestion and analysis pipeline")]
pub struct Args {
    /// Host to bind to (overrides PIPELINE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PIPELINE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides PIPELINE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PIPELINE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket holding datasets and reports (overrides PIPELINE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Key prefix whose writes trigger analysis (overrides PIPELINE_WATCHED_PREFIX)
    #[arg(long)]
    pub watched_prefix: Option<String>,

    /// Key prefix for analysis reports (overrides PIPELINE_REPORT_PREFIX)
    #[arg(long)]
    pub report_prefix: Option<String>,

    /// Population dataset URL (overrides PIPELINE_POPULATION_SOURCE_URL)
    #[arg(long)]
    pub population_source_url: Option<String>,

    /// BLS time series URL (overrides PIPELINE_BLS_SOURCE_URL)
    #[arg(long)]
    pub bls_source_url: Option<String>,

    /// Seconds between producer runs (overrides PIPELINE_SCHEDULE_PERIOD_SECS)
    #[arg(long)]
    pub schedule_period_secs: Option<u64>,

    /// Queue visibility timeout (overrides PIPELINE_VISIBILITY_TIMEOUT_SECS)
    #[arg(long)]
    pub visibility_timeout_secs: Option<u64>,

    /// Receives before a message is dead-lettered (overrides PIPELINE_MAX_RECEIVE_COUNT)
    #[arg(long)]
    pub max_receive_count: Option<u32>,

    /// How long dead letters are kept (overrides PIPELINE_DLQ_RETENTION_SECS)
    #[arg(long)]
    pub dlq_retention_secs: Option<u64>,

    /// Largest accepted message payload (overrides PIPELINE_MAX_MESSAGE_BYTES)
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Number of analysis consumers (overrides PIPELINE_CONSUMERS)
    #[arg(long)]
    pub consumers: Option<usize>,

    /// Long-poll wait per receive (overrides PIPELINE_POLL_WAIT_SECS)
    #[arg(long)]
    pub poll_wait_secs: Option<u64>,

    /// Budget for one analysis run (overrides PIPELINE_PROCESSING_TIMEOUT_SECS)
    #[arg(long)]
    pub processing_timeout_secs: Option<u64>,

    /// Background sweep interval (overrides PIPELINE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// HTTP timeout for producer fetches (overrides PIPELINE_FETCH_TIMEOUT_SECS)
    #[arg(long)]
    pub fetch_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Do not start the producer scheduler
    #[arg(long)]
    pub no_scheduler: bool,
}

/// Read `PIPELINE_{name}` or fall back to `default`.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let var = format!("PIPELINE_{}", name);
    match env::var(&var) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

fn secs(arg: Option<u64>, name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(match arg {
        Some(value) => value,
        None => env_or(name, default)?,
    }))
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        let cfg = Self {
            host: args.host.map_or_else(|| env_or("HOST", "0.0.0.0".to_string()), Ok)?,
            port: args.port.map_or_else(|| env_or("PORT", 3000), Ok)?,
            storage_dir: args
                .storage_dir
                .map_or_else(|| env_or("STORAGE_DIR", "./data/objects".to_string()), Ok)?,
            database_url: args.database_url.map_or_else(
                || env_or("DATABASE_URL", "sqlite://./data/meta/pipeline.db".to_string()),
                Ok,
            )?,
            bucket: args
                .bucket
                .map_or_else(|| env_or("BUCKET", "pipeline-data".to_string()), Ok)?,
            watched_prefix: args
                .watched_prefix
                .map_or_else(|| env_or("WATCHED_PREFIX", "population/".to_string()), Ok)?,
            report_prefix: args
                .report_prefix
                .map_or_else(|| env_or("REPORT_PREFIX", "reports/".to_string()), Ok)?,
            population_source_url: args.population_source_url.map_or_else(
                || {
                    env_or(
                        "POPULATION_SOURCE_URL",
                        "https://datausa.io/api/data?drilldowns=Nation&measures=Population"
                            .to_string(),
                    )
                },
                Ok,
            )?,
            bls_source_url: args.bls_source_url.map_or_else(
                || {
                    env_or(
                        "BLS_SOURCE_URL",
                        "https://download.bls.gov/pub/time.series/pr/pr.data.0.Current".to_string(),
                    )
                },
                Ok,
            )?,
            schedule_period: secs(args.schedule_period_secs, "SCHEDULE_PERIOD_SECS", 86_400)?,
            visibility_timeout: secs(args.visibility_timeout_secs, "VISIBILITY_TIMEOUT_SECS", 300)?,
            max_receive_count: args
                .max_receive_count
                .map_or_else(|| env_or("MAX_RECEIVE_COUNT", 3), Ok)?,
            dlq_retention: secs(args.dlq_retention_secs, "DLQ_RETENTION_SECS", 14 * 86_400)?,
            max_message_bytes: args
                .max_message_bytes
                .map_or_else(|| env_or("MAX_MESSAGE_BYTES", 256 * 1024), Ok)?,
            consumers: args.consumers.map_or_else(|| env_or("CONSUMERS", 2), Ok)?,
            poll_wait: secs(args.poll_wait_secs, "POLL_WAIT_SECS", 20)?,
            processing_timeout: secs(args.processing_timeout_secs, "PROCESSING_TIMEOUT_SECS", 240)?,
            sweep_interval: secs(args.sweep_interval_secs, "SWEEP_INTERVAL_SECS", 5)?,
            fetch_timeout: secs(args.fetch_timeout_secs, "FETCH_TIMEOUT_SECS", 30)?,
            scheduler_enabled: !args.no_scheduler,
        };
        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.queue_config()
            .validate()
            .context("invalid queue configuration")?;
        if self.max_message_bytes < MAX_OBJECT_KEY_LEN {
            bail!(
                "max message bytes {} is below the {} byte object key limit",
                self.max_message_bytes,
                MAX_OBJECT_KEY_LEN
            );
        }
        if self.consumers == 0 {
            bail!("at least one consumer is required");
        }
        if self.poll_wait > MAX_POLL_WAIT {
            bail!(
                "poll wait of {}s exceeds the {}s maximum",
                self.poll_wait.as_secs(),
                MAX_POLL_WAIT.as_secs()
            );
        }
        if self.schedule_period.is_zero() || self.sweep_interval.is_zero() {
            bail!("schedule period and sweep interval must be positive");
        }
        if BLS_KEY.starts_with(&self.watched_prefix) {
            bail!(
                "watched prefix `{}` covers the BLS dataset key `{}`",
                self.watched_prefix,
                BLS_KEY
            );
        }
        if self.report_prefix.starts_with(&self.watched_prefix) {
            bail!(
                "report prefix `{}` is inside the watched prefix `{}`; \
                 reports would re-trigger analysis",
                self.report_prefix,
                self.watched_prefix
            );
        }
        if self.processing_timeout >= self.visibility_timeout {
            tracing::warn!(
                processing_timeout_secs = self.processing_timeout.as_secs(),
                visibility_timeout_secs = self.visibility_timeout.as_secs(),
                "processing timeout is not below the visibility timeout; \
                 slow messages may be processed twice"
            );
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
            max_message_bytes: self.max_message_bytes,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            poll_wait: self.poll_wait,
            processing_timeout: self.processing_timeout,
        }
    }

    pub fn notification_rule(&self) -> NotificationRule {
        NotificationRule::prefix(self.watched_prefix.clone())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
