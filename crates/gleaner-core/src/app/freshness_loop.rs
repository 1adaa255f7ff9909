//! FreshnessLoop - 公開中 posting の liveness チェックを定期投入する

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{Actor, GleanerError, Result};
use crate::pipeline::Pipeline;

pub struct FreshnessLoop {
    pipeline: Pipeline,
    interval: Duration,
    max_age: chrono::Duration,
}

impl FreshnessLoop {
    pub fn new(pipeline: Pipeline, interval: Duration, max_age: Duration) -> Result<Self> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| GleanerError::Config(format!("freshness max age out of range: {e}")))?;
        Ok(Self {
            pipeline,
            interval,
            max_age,
        })
    }

    /// Enqueues checks for postings not checked within `max_age`.
    pub fn tick(&self) -> Result<usize> {
        let cutoff = self.pipeline.clock().now() - self.max_age;
        self.pipeline.enqueue_freshness_jobs(&Actor::System, cutoff)
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick() {
                            tracing::error!(error = %e, "freshness sweep failed");
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!("freshness scheduler stopped");
        })
    }
}
