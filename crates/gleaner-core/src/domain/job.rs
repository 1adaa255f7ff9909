//! Job record and its state machine.
//!
//! State transitions:
//! - Queued -> Claimed -> Done
//! - Queued -> Claimed -> Failed -> Queued (retry, with backoff)
//! - Queued -> Claimed -> Failed -> DeadLetter (retries exhausted)
//! - Claimed -> Queued (lease expired, reaper)
//!
//! The record only knows how to apply a transition. Guards (who may claim,
//! whether a retry is left) live in the ledger, which is the sole owner of
//! job rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::GleanerError;
use super::ids::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Dedupe,
    Extract,
    Enrich,
    CheckFreshness,
    ResolveUrlRedirects,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Dedupe,
        JobKind::Extract,
        JobKind::Enrich,
        JobKind::CheckFreshness,
        JobKind::ResolveUrlRedirects,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Dedupe => "dedupe",
            JobKind::Extract => "extract",
            JobKind::Enrich => "enrich",
            JobKind::CheckFreshness => "check_freshness",
            JobKind::ResolveUrlRedirects => "resolve_url_redirects",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = GleanerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| GleanerError::validation(format!("unknown job kind: {s}")))
    }
}

/// What a job points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Discovery,
    Candidate,
    Posting,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Discovery => "discovery",
            TargetType::Candidate => "candidate",
            TargetType::Posting => "posting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Done,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DeadLetter)
    }

    /// Not yet resolved one way or the other.
    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub target_type: TargetType,
    pub target_id: String,
    pub inputs: serde_json::Value,
    pub status: JobStatus,

    /// Number of claims so far (starts at 0).
    pub attempt: u32,
    pub max_attempts: u32,

    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub target_type: TargetType,
    pub target_id: String,
    pub inputs: serde_json::Value,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(kind: JobKind, target_type: TargetType, target_id: impl fmt::Display) -> Self {
        Self {
            kind,
            target_type,
            target_id: target_id.to_string(),
            inputs: serde_json::Value::Null,
            run_at: None,
        }
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

impl Job {
    pub fn new(id: JobId, spec: NewJob, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: spec.kind,
            target_type: spec.target_type,
            target_id: spec.target_id,
            inputs: spec.inputs,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts,
            locked_by: None,
            lease_expires_at: None,
            next_run_at: spec.run_at.unwrap_or(now),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.next_run_at <= now
    }

    pub fn is_held_by(&self, worker: &str) -> bool {
        self.status == JobStatus::Claimed && self.locked_by.as_deref() == Some(worker)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Claimed
            && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Queued -> Claimed (increments attempt).
    pub fn claim(&mut self, worker: &str, lease_expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.locked_by = Some(worker.to_string());
        self.lease_expires_at = Some(lease_expires_at);
        self.attempt += 1;
        self.updated_at = now;
    }

    /// Claimed -> Done.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.release_lock();
        self.updated_at = now;
    }

    /// Claimed -> Failed.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.release_lock();
        self.updated_at = now;
    }

    /// Failed -> Queued.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.next_run_at = next_run_at;
        self.updated_at = now;
    }

    /// Failed -> DeadLetter.
    pub fn mark_dead_letter(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::DeadLetter;
        self.updated_at = now;
    }

    /// Claimed -> Queued after lease expiry. Attempt count is left alone.
    pub fn release_expired(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.next_run_at = now;
        self.release_lock();
        self.updated_at = now;
    }

    fn release_lock(&mut self) {
        self.locked_by = None;
        self.lease_expires_at = None;
    }
}

/// What a worker reports for a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Done { result: serde_json::Value },
    Failed { error: String },
}

impl JobOutcome {
    pub fn done(result: serde_json::Value) -> Self {
        JobOutcome::Done { result }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        JobOutcome::Failed {
            error: error.into(),
        }
    }
}

/// Filter for `list_claimable_jobs`.
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Empty means any kind.
    pub kinds: Vec<JobKind>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            limit: 16,
        }
    }
}

impl JobFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = JobKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&job.kind)
    }
}

/// Counts by status for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl JobCounts {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Claimed => self.claimed += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::DeadLetter => self.dead_letter += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn job() -> Job {
        Job::new(
            JobId::from_ulid(Ulid::new()),
            NewJob::new(JobKind::Extract, TargetType::Discovery, "disc-1"),
            3,
            t0(),
        )
    }

    #[test]
    fn new_job_starts_queued_with_zero_attempts() {
        let j = job();
        assert_eq!(j.status, JobStatus::Queued);
        assert_eq!(j.attempt, 0);
        assert!(j.is_claimable(t0()));
    }

    #[test]
    fn job_scheduled_in_future_is_not_claimable_yet() {
        let mut j = job();
        j.next_run_at = t0() + Duration::seconds(10);
        assert!(!j.is_claimable(t0()));
        assert!(j.is_claimable(t0() + Duration::seconds(10)));
    }

    #[test]
    fn claim_sets_lock_and_increments_attempt() {
        let mut j = job();
        j.claim("w1", t0() + Duration::seconds(5), t0());
        assert_eq!(j.status, JobStatus::Claimed);
        assert_eq!(j.attempt, 1);
        assert!(j.is_held_by("w1"));
        assert!(!j.is_held_by("w2"));
        assert!(!j.lease_expired(t0() + Duration::seconds(5)));
        assert!(j.lease_expired(t0() + Duration::seconds(6)));
    }

    #[test]
    fn release_expired_keeps_attempt() {
        let mut j = job();
        j.claim("w1", t0() + Duration::seconds(5), t0());
        j.release_expired(t0() + Duration::seconds(10));
        assert_eq!(j.status, JobStatus::Queued);
        assert_eq!(j.attempt, 1);
        assert!(j.locked_by.is_none());
        assert!(j.lease_expires_at.is_none());
    }

    #[test]
    fn kind_parses_from_wire_name() {
        assert_eq!("check_freshness".parse::<JobKind>().unwrap(), JobKind::CheckFreshness);
        assert!("crawl".parse::<JobKind>().is_err());
        let s = serde_json::to_string(&JobKind::ResolveUrlRedirects).unwrap();
        assert_eq!(s, "\"resolve_url_redirects\"");
    }

    #[test]
    fn outcome_is_tagged_by_status() {
        let v = serde_json::to_value(JobOutcome::failed("timeout")).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error"], "timeout");
    }
}
