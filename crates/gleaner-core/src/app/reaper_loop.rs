//! ReaperLoop - lease 期限切れ job の回収
//!
//! 一定間隔で `reap_expired_jobs` を呼ぶだけです。回収は ledger の
//! 条件付き更新で行われるので、複数の reaper が同時に走っても
//! 同じ job が二重に戻されることはありません。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{Actor, Result};
use crate::pipeline::Pipeline;

pub struct ReaperLoop {
    pipeline: Pipeline,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(pipeline: Pipeline, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    /// One sweep. Returns how many jobs went back to `queued`.
    pub fn tick(&self) -> Result<usize> {
        let reaped = self.pipeline.reap_expired_jobs(&Actor::System)?;
        if reaped > 0 {
            tracing::info!(reaped, "expired leases requeued");
        }
        Ok(reaped)
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
                            tracing::error!(error = %e, "reaper sweep failed");
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::info!("reaper stopped");
        })
    }
}
