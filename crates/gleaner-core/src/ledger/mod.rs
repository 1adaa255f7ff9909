//! Job Ledger - lease ベースの durable queue
//!
//! Job 行を書き換えるのはこのモジュールだけです。すべての遷移は
//! `Tx::compare_and_set_job` による条件付き更新で確定させるため、
//! 同じ job を同時に claim しても成功するのは高々 1 人です。
//!
//! ```text
//! queued ──claim──▶ claimed ──done──▶ done
//!   ▲                  │
//!   │                  └─failed─▶ failed ──retry──▶ queued
//!   │                                  └──exhausted─▶ dead_letter
//!   └──────── lease expired (reaper) ◀── claimed
//! ```
//!
//! `submit_result` のドメイン副作用（candidate 生成、freshness 判定など）は
//! `JobEffects` として同じ `Tx` の中で実行されます。

pub mod retry;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::domain::{
    Actor, ConflictKind, EntityKind, EntityType, GleanerError, Job, JobFilter, JobId, JobOutcome,
    JobResult, JobStatus, NewEvent, NewJob, Result,
};
use crate::ports::{Clock, IdGenerator, Tx, next_id};
use crate::provenance::ProvenanceRecorder;

pub use retry::RetryPolicy;

/// Domain reactions to a settled job, run in the ledger's transaction.
pub trait JobEffects {
    fn on_done(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job, result: &JobResult) -> Result<()>;

    /// The job failed and was put back in the queue.
    fn on_retry_scheduled(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job) -> Result<()>;

    fn on_dead_letter(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job) -> Result<()>;
}

/// Where a submitted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Done,
    RetryScheduled { next_run_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    pub settlement: Settlement,
}

#[derive(Clone)]
pub struct JobLedger {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    provenance: ProvenanceRecorder,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl JobLedger {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        provenance: ProvenanceRecorder,
        retry: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            clock,
            ids,
            provenance,
            retry,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Inserts a queued job. Call-site specific deduplication is the caller's job.
    pub fn enqueue(&self, tx: &mut dyn Tx, actor: &Actor, spec: NewJob) -> Result<Job> {
        let now = self.clock.now();
        let job = Job::new(next_id(self.ids.as_ref()), spec, self.max_attempts, now);
        tx.insert_job(&job)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Job, job.id, "job.enqueued").with_payload(json!({
                "kind": job.kind,
                "target_type": job.target_type,
                "target_id": job.target_id,
                "next_run_at": job.next_run_at,
            })),
        )?;
        tracing::debug!(job_id = %job.id, kind = %job.kind, target_id = %job.target_id, "job enqueued");
        Ok(job)
    }

    pub fn list_claimable(&self, tx: &dyn Tx, filter: &JobFilter) -> Result<Vec<Job>> {
        tx.claimable_jobs(self.clock.now(), filter)
    }

    /// `queued -> claimed`, decided by one conditional update.
    #[tracing::instrument(skip(self, tx), fields(actor = %actor))]
    pub fn claim(&self, tx: &mut dyn Tx, actor: &Actor, job_id: JobId, lease_secs: u32) -> Result<Job> {
        if lease_secs == 0 {
            return Err(GleanerError::validation("lease_secs must be positive"));
        }
        let now = self.clock.now();
        let job = load(tx, job_id)?;
        if !job.is_claimable(now) {
            let current = if job.status == JobStatus::Queued {
                format!("queued until {}", job.next_run_at)
            } else {
                job.status.to_string()
            };
            return Err(GleanerError::conflict(
                ConflictKind::NotClaimable,
                EntityKind::Job,
                job_id,
                current,
                JobStatus::Claimed,
            ));
        }

        let expected = (job.status, job.attempt);
        let mut claimed = job;
        let holder = actor.to_string();
        claimed.claim(&holder, now + Duration::seconds(i64::from(lease_secs)), now);
        if !tx.compare_and_set_job(expected, &claimed)? {
            return Err(GleanerError::conflict(
                ConflictKind::ClaimLost,
                EntityKind::Job,
                job_id,
                "claimed by another worker",
                JobStatus::Claimed,
            ));
        }

        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Job, job_id, "job.claimed").with_payload(json!({
                "attempt": claimed.attempt,
                "lease_expires_at": claimed.lease_expires_at,
            })),
        )?;
        tracing::info!(job_id = %job_id, kind = %claimed.kind, attempt = claimed.attempt, "job claimed");
        Ok(claimed)
    }

    /// Settles a claimed job held by `actor` and runs its domain effects.
    ///
    /// A `done` payload is decoded for the job kind before anything is written.
    #[tracing::instrument(skip(self, tx, outcome, effects), fields(actor = %actor))]
    pub fn submit_result(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        job_id: JobId,
        outcome: JobOutcome,
        effects: &dyn JobEffects,
    ) -> Result<SubmitOutcome> {
        let now = self.clock.now();
        let job = load(tx, job_id)?;
        let holder = actor.to_string();
        if !job.is_held_by(&holder) {
            let current = match &job.locked_by {
                Some(by) => format!("{} by {by}", job.status),
                None => job.status.to_string(),
            };
            return Err(GleanerError::conflict(
                ConflictKind::NotLeaseHolder,
                EntityKind::Job,
                job_id,
                current,
                format!("submit by {holder}"),
            ));
        }
        let expected = (job.status, job.attempt);

        match outcome {
            JobOutcome::Done { result } => {
                let decoded = JobResult::decode(job.kind, &result)?;
                let mut done = job;
                done.complete(result, now);
                self.write(tx, expected, &done)?;
                self.provenance.record(
                    tx,
                    actor,
                    NewEvent::new(EntityType::Job, job_id, "job.completed")
                        .with_payload(json!({ "attempt": done.attempt })),
                )?;
                tracing::info!(job_id = %job_id, kind = %done.kind, "job done");
                effects.on_done(tx, actor, &done, &decoded)?;
                Ok(SubmitOutcome {
                    job: done,
                    settlement: Settlement::Done,
                })
            }
            JobOutcome::Failed { error } => {
                let mut failed = job;
                failed.fail(error.clone(), now);
                self.provenance.record(
                    tx,
                    actor,
                    NewEvent::new(EntityType::Job, job_id, "job.failed")
                        .with_payload(json!({ "attempt": failed.attempt, "error": error })),
                )?;

                if failed.retries_exhausted() {
                    failed.mark_dead_letter(now);
                    self.write(tx, expected, &failed)?;
                    self.provenance.record(
                        tx,
                        actor,
                        NewEvent::new(EntityType::Job, job_id, "job.dead_lettered")
                            .with_payload(json!({ "attempts": failed.attempt })),
                    )?;
                    tracing::warn!(job_id = %job_id, kind = %failed.kind, attempts = failed.attempt, "job dead-lettered");
                    effects.on_dead_letter(tx, actor, &failed)?;
                    Ok(SubmitOutcome {
                        job: failed,
                        settlement: Settlement::DeadLettered,
                    })
                } else {
                    let delay = Duration::from_std(self.retry.next_delay(failed.attempt))
                        .map_err(|e| GleanerError::Fatal(format!("retry delay out of range: {e}")))?;
                    let next_run_at = now + delay;
                    failed.schedule_retry(next_run_at, now);
                    self.write(tx, expected, &failed)?;
                    self.provenance.record(
                        tx,
                        actor,
                        NewEvent::new(EntityType::Job, job_id, "job.retry_scheduled").with_payload(
                            json!({ "attempt": failed.attempt, "next_run_at": next_run_at }),
                        ),
                    )?;
                    tracing::info!(job_id = %job_id, kind = %failed.kind, attempt = failed.attempt, %next_run_at, "job retry scheduled");
                    effects.on_retry_scheduled(tx, actor, &failed)?;
                    Ok(SubmitOutcome {
                        job: failed,
                        settlement: Settlement::RetryScheduled { next_run_at },
                    })
                }
            }
        }
    }

    /// Moves every expired lease back to `queued`. Attempt counts are kept.
    ///
    /// A lease that expires on the last allowed attempt counts as a failure
    /// and the job goes to `dead_letter` instead.
    /// Each row is released with the same conditional update `claim` uses, so
    /// a row that was reclaimed in the meantime is left alone.
    #[tracing::instrument(skip(self, tx, effects), fields(actor = %actor))]
    pub fn reap_expired(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        effects: &dyn JobEffects,
    ) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut reaped = Vec::new();
        for job in tx.expired_leases(now)? {
            let expected = (job.status, job.attempt);
            let previous_holder = job.locked_by.clone();
            let mut released = job;
            let exhausted = released.retries_exhausted();
            if exhausted {
                let error = format!("lease expired on attempt {}", released.attempt);
                released.fail(error, now);
                released.mark_dead_letter(now);
            } else {
                released.release_expired(now);
            }
            if !tx.compare_and_set_job(expected, &released)? {
                continue;
            }
            self.provenance.record(
                tx,
                actor,
                NewEvent::new(EntityType::Job, released.id, "job.lease_expired").with_payload(
                    json!({ "previous_holder": previous_holder, "attempt": released.attempt }),
                ),
            )?;
            if exhausted {
                self.provenance.record(
                    tx,
                    actor,
                    NewEvent::new(EntityType::Job, released.id, "job.dead_lettered")
                        .with_payload(json!({ "attempts": released.attempt })),
                )?;
                tracing::warn!(job_id = %released.id, kind = %released.kind, attempts = released.attempt, "expired lease dead-lettered");
                effects.on_dead_letter(tx, actor, &released)?;
            } else {
                tracing::info!(job_id = %released.id, kind = %released.kind, "expired lease reaped");
            }
            reaped.push(released);
        }
        Ok(reaped)
    }

    fn write(&self, tx: &mut dyn Tx, expected: (JobStatus, u32), job: &Job) -> Result<()> {
        if tx.compare_and_set_job(expected, job)? {
            Ok(())
        } else {
            Err(GleanerError::conflict(
                ConflictKind::NotLeaseHolder,
                EntityKind::Job,
                job.id,
                "changed concurrently",
                job.status,
            ))
        }
    }
}

fn load(tx: &dyn Tx, id: JobId) -> Result<Job> {
    tx.job(id)?
        .ok_or_else(|| GleanerError::not_found(EntityKind::Job, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, TargetType};
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, UlidGenerator, in_transaction};
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    struct NoEffects;

    impl JobEffects for NoEffects {
        fn on_done(&self, _: &mut dyn Tx, _: &Actor, _: &Job, _: &JobResult) -> Result<()> {
            Ok(())
        }
        fn on_retry_scheduled(&self, _: &mut dyn Tx, _: &Actor, _: &Job) -> Result<()> {
            Ok(())
        }
        fn on_dead_letter(&self, _: &mut dyn Tx, _: &Actor, _: &Job) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<FixedClock>,
        store: InMemoryStore,
        ledger: JobLedger,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let provenance = ProvenanceRecorder::new(clock.clone(), ids.clone());
        let retry = RetryPolicy::fixed(StdDuration::from_secs(2), 2.0, StdDuration::from_secs(60));
        let ledger = JobLedger::new(clock.clone(), ids, provenance, retry, 3);
        Fixture {
            clock,
            store: InMemoryStore::new(),
            ledger,
        }
    }

    fn enqueue(f: &Fixture, kind: JobKind) -> Job {
        in_transaction(&f.store, |tx| {
            f.ledger.enqueue(
                tx,
                &Actor::System,
                NewJob::new(kind, TargetType::Candidate, "cand-x"),
            )
        })
        .unwrap()
    }

    #[test]
    fn second_claim_is_a_conflict() {
        let f = fixture();
        let job = enqueue(&f, JobKind::Dedupe);
        let w1 = Actor::worker("w1");
        let w2 = Actor::worker("w2");

        let claimed = in_transaction(&f.store, |tx| f.ledger.claim(tx, &w1, job.id, 30)).unwrap();
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.locked_by.as_deref(), Some("worker:w1"));

        let err = in_transaction(&f.store, |tx| f.ledger.claim(tx, &w2, job.id, 30)).unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::NotClaimable));
    }

    #[test]
    fn only_the_holder_may_submit() {
        let f = fixture();
        let job = enqueue(&f, JobKind::Dedupe);
        let w1 = Actor::worker("w1");
        in_transaction(&f.store, |tx| f.ledger.claim(tx, &w1, job.id, 30)).unwrap();

        let err = in_transaction(&f.store, |tx| {
            f.ledger.submit_result(
                tx,
                &Actor::worker("w2"),
                job.id,
                JobOutcome::done(json!({})),
                &NoEffects,
            )
        })
        .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::NotLeaseHolder));
    }

    #[test]
    fn failures_back_off_then_dead_letter() {
        let f = fixture();
        let job = enqueue(&f, JobKind::Dedupe);
        let w = Actor::worker("w1");

        for attempt in 1..=3u32 {
            in_transaction(&f.store, |tx| f.ledger.claim(tx, &w, job.id, 30)).unwrap();
            let out = in_transaction(&f.store, |tx| {
                f.ledger
                    .submit_result(tx, &w, job.id, JobOutcome::failed("timeout"), &NoEffects)
            })
            .unwrap();
            if attempt < 3 {
                let expected = f.clock.now() + Duration::seconds(2 * 2i64.pow(attempt - 1));
                assert_eq!(
                    out.settlement,
                    Settlement::RetryScheduled {
                        next_run_at: expected
                    }
                );
                assert_eq!(out.job.status, JobStatus::Queued);
                f.clock.advance(Duration::seconds(60));
            } else {
                assert_eq!(out.settlement, Settlement::DeadLettered);
                assert_eq!(out.job.status, JobStatus::DeadLetter);
            }
        }
    }

    #[test]
    fn malformed_done_payload_leaves_job_claimed() {
        let f = fixture();
        let job = enqueue(&f, JobKind::Extract);
        let w = Actor::worker("w1");
        in_transaction(&f.store, |tx| f.ledger.claim(tx, &w, job.id, 30)).unwrap();

        let err = in_transaction(&f.store, |tx| {
            f.ledger.submit_result(
                tx,
                &w,
                job.id,
                JobOutcome::done(json!({"fields": {}, "bogus": 1})),
                &NoEffects,
            )
        })
        .unwrap_err();
        assert!(matches!(err, GleanerError::Validation(_)));

        let stored = in_transaction(&f.store, |tx| tx.job(job.id)).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Claimed);
        assert!(stored.result.is_none());
    }

    #[test]
    fn reaper_is_idempotent() {
        let f = fixture();
        let job = enqueue(&f, JobKind::Dedupe);
        let w = Actor::worker("w1");
        in_transaction(&f.store, |tx| f.ledger.claim(tx, &w, job.id, 5)).unwrap();

        f.clock.advance(Duration::seconds(10));
        let first = in_transaction(&f.store, |tx| f.ledger.reap_expired(tx, &Actor::System, &NoEffects)).unwrap();
        let second = in_transaction(&f.store, |tx| f.ledger.reap_expired(tx, &Actor::System, &NoEffects)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt, 1);
        assert!(second.is_empty());
    }

    #[test]
    fn lease_expiring_on_the_last_attempt_dead_letters() {
        let f = fixture();
        let job = enqueue(&f, JobKind::Extract);
        let w = Actor::worker("w1");

        for attempt in 1..=3u32 {
            in_transaction(&f.store, |tx| f.ledger.claim(tx, &w, job.id, 30)).unwrap();
            // rejected payloads never settle the job
            let err = in_transaction(&f.store, |tx| {
                f.ledger.submit_result(
                    tx,
                    &w,
                    job.id,
                    JobOutcome::done(json!({"fields": {"organization": 7}})),
                    &NoEffects,
                )
            })
            .unwrap_err();
            assert!(matches!(err, GleanerError::Validation(_)));

            f.clock.advance(Duration::seconds(31));
            let reaped =
                in_transaction(&f.store, |tx| f.ledger.reap_expired(tx, &Actor::System, &NoEffects))
                    .unwrap();
            assert_eq!(reaped.len(), 1);
            let expected = if attempt < 3 {
                JobStatus::Queued
            } else {
                JobStatus::DeadLetter
            };
            assert_eq!(reaped[0].status, expected);
        }

        let stored = in_transaction(&f.store, |tx| tx.job(job.id)).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::DeadLetter);
        assert_eq!(stored.attempt, 3);
        assert!(stored.locked_by.is_none());
        assert_eq!(stored.error.as_deref(), Some("lease expired on attempt 3"));

        let err = in_transaction(&f.store, |tx| f.ledger.claim(tx, &w, job.id, 30)).unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::NotClaimable));
    }
}
