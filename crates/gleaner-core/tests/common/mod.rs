//! Shared harness: a pipeline over `InMemoryStore` driven by a `FixedClock`.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use gleaner_core::domain::{
    Actor, CandidateId, Discovery, Job, JobKind, JobOutcome, JobStatus, NewJob, TargetType,
    TrustPolicy,
};
use gleaner_core::ledger::SubmitOutcome;
use gleaner_core::ports::{Clock, FixedClock};
use gleaner_core::{DiscoveryIntake, GleanerConfig, Pipeline};

pub struct Harness {
    pub clock: Arc<FixedClock>,
    pub pipeline: Pipeline,
    pub worker: Actor,
    pub admin: Actor,
    pub moderator: Actor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(GleanerConfig::default())
    }

    pub fn with_config(config: GleanerConfig) -> Self {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        let shared: Arc<dyn Clock> = clock.clone();
        Self {
            pipeline: Pipeline::in_memory(&config, shared),
            clock,
            worker: Actor::worker("w-test"),
            admin: Actor::admin("root"),
            moderator: Actor::moderator("mod"),
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    pub fn trust(&self, source_key: &str) {
        self.pipeline
            .put_trust_policy(&self.admin, &TrustPolicy::trusted(source_key))
            .unwrap();
    }

    pub fn ingest(&self, source_key: &str, url: &str, hash: &str) -> (Discovery, Job) {
        self.pipeline
            .ingest_discovery(&Actor::System, DiscoveryIntake::new(source_key, url, hash))
            .unwrap()
    }

    /// Enqueues a follow-up job aimed at `candidate`.
    pub fn enqueue_for(&self, kind: JobKind, candidate: CandidateId, inputs: serde_json::Value) -> Job {
        self.pipeline
            .enqueue_job(
                &Actor::System,
                NewJob::new(kind, TargetType::Candidate, candidate).with_inputs(inputs),
            )
            .unwrap()
    }

    pub fn claim(&self, job: &Job) -> Job {
        self.pipeline.claim(&self.worker, job.id, 30).unwrap()
    }

    pub fn complete(&self, job: &Job, result: serde_json::Value) -> SubmitOutcome {
        self.claim(job);
        self.pipeline
            .submit_result(&self.worker, job.id, JobOutcome::done(result))
            .unwrap()
    }

    pub fn fail(&self, job: &Job, error: &str) -> SubmitOutcome {
        self.claim(job);
        self.pipeline
            .submit_result(&self.worker, job.id, JobOutcome::failed(error))
            .unwrap()
    }

    /// Ingests a discovery and settles its extract job with `title` / `organization`.
    pub fn ingest_extracted(
        &self,
        source_key: &str,
        url: &str,
        hash: &str,
        title: &str,
        organization: &str,
    ) -> CandidateId {
        // keeps creation order (and so primary selection) deterministic
        self.advance_secs(1);
        let (discovery, job) = self.ingest(source_key, url, hash);
        let outcome = self.complete(
            &job,
            json!({ "fields": { "title": title, "organization": organization } }),
        );
        assert_eq!(outcome.job.status, JobStatus::Done);
        self.pipeline
            .candidate_for_discovery(discovery.id)
            .unwrap()
            .expect("extract materializes a candidate")
    }
}
