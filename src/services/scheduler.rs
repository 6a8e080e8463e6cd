//! Fixed-rate trigger for the producers.
//!
//! Each tick spawns the job as its own task, so a slow run never delays the
//! next trigger and runs may overlap.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::producer::ProducerSet;

/// Work fired on every tick.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self);
}

#[async_trait]
impl ScheduledJob for ProducerSet {
    async fn run(&self) {
        let results = self.run_all().await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(sources = results.len(), failed, "scheduled producer run finished");
    }
}

pub struct Scheduler {
    period: Duration,
    run_on_start: bool,
    job: Arc<dyn ScheduledJob>,
}

impl Scheduler {
    pub fn new(period: Duration, job: Arc<dyn ScheduledJob>) -> Self {
        Self {
            period,
            run_on_start: true,
            job,
        }
    }

    /// When false, the first run happens one period after start.
    pub fn run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    /// Tick until `shutdown` is cancelled, then wait for in-progress runs.
    /// Returns the number of runs triggered.
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        let start = if self.run_on_start {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + self.period
        };
        let mut ticker = tokio::time::interval_at(start, self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(period_secs = self.period.as_secs(), "scheduler started");
        let mut runs = JoinSet::new();
        let mut triggered: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    triggered += 1;
                    debug!(run = triggered, in_progress = runs.len(), "scheduler trigger");
                    let job = Arc::clone(&self.job);
                    runs.spawn(async move { job.run().await });
                }
                Some(finished) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = %err, "scheduled run panicked");
                    }
                }
            }
        }

        info!(in_progress = runs.len(), "scheduler stopping, waiting for running jobs");
        while let Some(finished) = runs.join_next().await {
            if let Err(err) = finished {
                warn!(error = %err, "scheduled run panicked");
            }
        }
        triggered
    }
}
