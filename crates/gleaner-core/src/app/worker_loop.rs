//! WorkerLoop - job 実行ループ
//!
//! # フロー
//! 1. `list_claimable_jobs` で実行可能な job を取得
//! 2. `claim` で lease を取る（負けたら次の job へ）
//! 3. executor を実行して `JobOutcome` を得る
//! 4. `submit_result` で ledger とドメイン状態を 1 トランザクションで更新
//!
//! 空振りが続いたら `PollBackoff` で待ち時間を伸ばします。
//! 実行中の job を外から止める手段はなく、shutdown は「新しい lease を
//! 取らない」だけです。止まった job は lease 切れで reaper が回収します。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::domain::{Actor, ConflictKind, GleanerError, Job, JobFilter, JobOutcome, Result};
use crate::pipeline::Pipeline;
use crate::typed::ExecutorRegistry;

use super::backoff::PollBackoff;

/// Worker group handle.
/// - `request_shutdown()` で全ワーカーが新しい lease を取らなくなる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawns `config.workers` loops named `w0`, `w1`, ...
    pub fn spawn(pipeline: Pipeline, registry: Arc<ExecutorRegistry>, config: &WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(config.workers);
        for n in 0..config.workers {
            let worker = WorkerLoop::new(format!("w{n}"), pipeline.clone(), Arc::clone(&registry), config);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker.run(rx)));
        }
        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

pub struct WorkerLoop {
    actor: Actor,
    pipeline: Pipeline,
    registry: Arc<ExecutorRegistry>,
    filter: JobFilter,
    lease_secs: u32,
    backoff: PollBackoff,
}

impl WorkerLoop {
    pub fn new(
        id: impl Into<String>,
        pipeline: Pipeline,
        registry: Arc<ExecutorRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let filter = JobFilter::kinds(registry.registered_kinds()).with_limit(config.batch_size.max(1));
        let lease_secs = pipeline.default_lease_secs();
        Self {
            actor: Actor::worker(id),
            pipeline,
            registry,
            filter,
            lease_secs,
            backoff: PollBackoff::new(
                Duration::from_millis(config.poll_min_ms),
                Duration::from_millis(config.poll_max_ms),
            ),
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.actor, kinds = ?self.filter.kinds, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(0) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::error!(worker = %self.actor, error = %e, "worker poll failed");
                    true
                }
            };
            if !idle {
                self.backoff.reset();
                continue;
            }
            let delay = self.backoff.next_delay();
            tracing::debug!(worker = %self.actor, delay_ms = delay.as_millis() as u64, "no claimable jobs");
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!(worker = %self.actor, "worker stopped");
    }

    /// One poll: claims and settles every job of a batch it can win.
    /// Returns how many jobs were settled.
    pub async fn run_once(&self) -> Result<usize> {
        let jobs = self.pipeline.list_claimable_jobs(&self.actor, &self.filter)?;
        let mut settled = 0;
        for job in jobs {
            let claimed = match self.pipeline.claim(&self.actor, job.id, self.lease_secs) {
                Ok(claimed) => claimed,
                Err(e) if lost_race(&e) => {
                    tracing::debug!(worker = %self.actor, job_id = %job.id, error = %e, "claim lost");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let outcome = self.execute(&claimed).await;
            if self.submit(&claimed, outcome)? {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Returns whether the job was settled. A rejected payload is reported
    /// back as a failed attempt so it retries and eventually dead-letters.
    fn submit(&self, job: &Job, outcome: JobOutcome) -> Result<bool> {
        let msg = match self.pipeline.submit_result(&self.actor, job.id, outcome) {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() => {
                tracing::warn!(worker = %self.actor, job_id = %job.id, error = %e, "result not accepted");
                return Ok(false);
            }
            Err(GleanerError::Validation(msg)) => msg,
            Err(e) => return Err(e),
        };
        tracing::error!(worker = %self.actor, job_id = %job.id, error = %msg, "result payload rejected");
        let failed = JobOutcome::failed(format!("result rejected: {msg}"));
        match self.pipeline.submit_result(&self.actor, job.id, failed) {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                tracing::warn!(worker = %self.actor, job_id = %job.id, error = %e, "failure not accepted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, job: &Job) -> JobOutcome {
        match self.registry.get(job.kind) {
            Some(executor) => executor.execute_dyn(job.inputs.clone()).await,
            None => JobOutcome::failed(format!("no executor registered for {}", job.kind)),
        }
    }
}

fn lost_race(e: &GleanerError) -> bool {
    matches!(
        e.conflict_kind(),
        Some(ConflictKind::ClaimLost | ConflictKind::NotClaimable)
    )
}
