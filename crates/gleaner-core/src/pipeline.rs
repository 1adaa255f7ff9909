//! Pipeline - 外部コラボレータ向けの操作をまとめた facade
//!
//! 1 つの呼び出し = 1 つのトランザクションです。capability の確認は
//! トランザクションを開く前に行い、`Conflict` / `Validation` で失敗した
//! 操作はロールバックされるので、ストアには何も残りません。
//!
//! - worker: `list_claimable_jobs`, `claim`, `submit_result`
//! - moderation: `patch_candidate`, `merge_candidates`, `patch_posting`
//! - admin: `override_candidate`, `override_posting`, `put_trust_policy`
//! - scheduling / ingest: `enqueue_freshness_jobs`, `reap_expired_jobs`,
//!   `ingest_discovery`, `enqueue_job`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::config::GleanerConfig;
use crate::dedupe::{DedupeScorer, canonical_url};
use crate::domain::{
    Actor, CandidateId, CandidateState, Capability, DedupeInput, Discovery, DiscoveryId, EnrichInput,
    EntityKind, EntityType, ExtractInput, FreshnessInput, GleanerError, Job, JobCounts, JobFilter,
    JobId, JobKind, JobOutcome, MergeDecision, MergeDecisionKind, NewJob, Posting,
    PostingCandidate, PostingId, PostingStatus, ProvenanceEvent, RedirectInput, Result,
    TargetType, TrustPolicy,
};
use crate::effects::DomainEffects;
use crate::impls::InMemoryStore;
use crate::ledger::{JobLedger, SubmitOutcome};
use crate::lifecycle::{CandidateMachine, PostingLifecycle};
use crate::policy::TrustPolicyEngine;
use crate::ports::{Clock, IdGenerator, Store, Tx, UlidGenerator, in_transaction, next_id};
use crate::provenance::ProvenanceRecorder;
use crate::router::MergeRouter;

/// A raw record handed over by an ingestion connector.
#[derive(Debug, Clone)]
pub struct DiscoveryIntake {
    pub source_key: String,
    pub url: String,
    pub canonical_hash: String,
    pub raw: serde_json::Value,
}

impl DiscoveryIntake {
    pub fn new(
        source_key: impl Into<String>,
        url: impl Into<String>,
        canonical_hash: impl Into<String>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            url: url.into(),
            canonical_hash: canonical_hash.into(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    ledger: JobLedger,
    policies: TrustPolicyEngine,
    candidates: CandidateMachine,
    postings: PostingLifecycle,
    router: MergeRouter,
    effects: DomainEffects,
    default_lease_secs: u32,
}

impl Pipeline {
    pub fn new(
        config: &GleanerConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let provenance = ProvenanceRecorder::new(clock.clone(), ids.clone());
        let ledger = JobLedger::new(
            clock.clone(),
            ids.clone(),
            provenance.clone(),
            config.ledger.retry_policy(),
            config.ledger.max_attempts,
        );
        let policies = TrustPolicyEngine::new(config.default_policy.clone(), provenance.clone());
        let candidates = CandidateMachine::new(clock.clone(), provenance.clone());
        let postings = PostingLifecycle::new(
            clock.clone(),
            ids.clone(),
            provenance.clone(),
            candidates.clone(),
        );
        let router = MergeRouter::new(
            clock.clone(),
            ids.clone(),
            provenance,
            DedupeScorer::new(config.dedupe.clone()),
            policies.clone(),
            candidates.clone(),
            postings.clone(),
        );
        let effects = DomainEffects::new(
            clock.clone(),
            ids.clone(),
            candidates.clone(),
            postings.clone(),
            router.clone(),
        );
        Self {
            store,
            clock,
            ids,
            ledger,
            policies,
            candidates,
            postings,
            router,
            effects,
            default_lease_secs: config.ledger.lease_secs,
        }
    }

    /// Pipeline over a fresh `InMemoryStore` with ULID ids from `clock`.
    pub fn in_memory(config: &GleanerConfig, clock: Arc<dyn Clock>) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        Self::new(config, Arc::new(InMemoryStore::new()), clock, ids)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Lease length from `[ledger] lease_secs`.
    pub fn default_lease_secs(&self) -> u32 {
        self.default_lease_secs
    }

    fn transaction<T>(&self, f: impl FnOnce(&mut dyn Tx) -> Result<T>) -> Result<T> {
        in_transaction(self.store.as_ref(), f)
    }

    // ========================================
    // ingest / scheduling
    // ========================================

    /// Appends a discovery and enqueues its `extract` job.
    pub fn ingest_discovery(&self, actor: &Actor, intake: DiscoveryIntake) -> Result<(Discovery, Job)> {
        actor.require(Capability::Schedule)?;
        if intake.source_key.trim().is_empty() {
            return Err(GleanerError::validation("source_key must not be empty"));
        }
        if intake.canonical_hash.trim().is_empty() {
            return Err(GleanerError::validation("canonical_hash must not be empty"));
        }
        let normalized = canonical_url(&intake.url)
            .ok_or_else(|| GleanerError::validation(format!("not an http(s) URL: {}", intake.url)))?;

        self.transaction(|tx| {
            let discovery = Discovery::new(
                next_id(self.ids.as_ref()),
                intake.source_key,
                normalized,
                intake.canonical_hash,
                self.clock.now(),
            )
            .with_raw(intake.raw);
            tx.insert_discovery(&discovery)?;

            let input = ExtractInput {
                discovery_id: discovery.id,
                source_key: discovery.source_key.clone(),
                normalized_url: discovery.normalized_url.clone(),
                canonical_hash: discovery.canonical_hash.clone(),
            };
            let job = self.ledger.enqueue(
                tx,
                actor,
                NewJob::new(JobKind::Extract, TargetType::Discovery, discovery.id)
                    .with_inputs(serde_json::to_value(&input)?),
            )?;
            tracing::info!(discovery_id = %discovery.id, job_id = %job.id, source_key = %discovery.source_key, "discovery ingested");
            Ok((discovery, job))
        })
    }

    /// Enqueues a follow-up job (`enrich`, `resolve_url_redirects`, `dedupe`, ...).
    /// Inputs are checked against the kind before anything is written.
    pub fn enqueue_job(&self, actor: &Actor, spec: NewJob) -> Result<Job> {
        actor.require(Capability::Schedule)?;
        check_inputs(spec.kind, &spec.inputs)?;
        self.transaction(|tx| self.ledger.enqueue(tx, actor, spec))
    }

    /// Enqueues `check_freshness` for every live posting not checked since
    /// `cutoff`. Postings that already have a pending check are skipped.
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub fn enqueue_freshness_jobs(&self, actor: &Actor, cutoff: DateTime<Utc>) -> Result<usize> {
        actor.require(Capability::Schedule)?;
        self.transaction(|tx| {
            let mut enqueued = 0;
            for posting in tx.postings_due(cutoff)? {
                let target = posting.id.to_string();
                if !tx.pending_jobs_for(JobKind::CheckFreshness, &target)?.is_empty() {
                    continue;
                }
                let input = FreshnessInput {
                    posting_id: posting.id,
                    url: posting.url.clone(),
                };
                self.ledger.enqueue(
                    tx,
                    actor,
                    NewJob::new(JobKind::CheckFreshness, TargetType::Posting, posting.id)
                        .with_inputs(serde_json::to_value(&input)?),
                )?;
                enqueued += 1;
            }
            if enqueued > 0 {
                tracing::info!(enqueued, %cutoff, "freshness checks enqueued");
            }
            Ok(enqueued)
        })
    }

    pub fn reap_expired_jobs(&self, actor: &Actor) -> Result<usize> {
        actor.require(Capability::Schedule)?;
        self.transaction(|tx| Ok(self.ledger.reap_expired(tx, actor, &self.effects)?.len()))
    }

    // ========================================
    // worker
    // ========================================

    pub fn list_claimable_jobs(&self, actor: &Actor, filter: &JobFilter) -> Result<Vec<Job>> {
        actor.require(Capability::ProcessJobs)?;
        self.transaction(|tx| self.ledger.list_claimable(tx, filter))
    }

    pub fn claim(&self, actor: &Actor, job_id: JobId, lease_secs: u32) -> Result<Job> {
        actor.require(Capability::ProcessJobs)?;
        self.transaction(|tx| self.ledger.claim(tx, actor, job_id, lease_secs))
    }

    /// Settles a claimed job and applies its domain effects in the same transaction.
    pub fn submit_result(&self, actor: &Actor, job_id: JobId, outcome: JobOutcome) -> Result<SubmitOutcome> {
        actor.require(Capability::ProcessJobs)?;
        self.transaction(|tx| {
            self.ledger
                .submit_result(tx, actor, job_id, outcome, &self.effects)
        })
    }

    // ========================================
    // moderation
    // ========================================

    /// Guarded candidate transition.
    ///
    /// `needs_review|processed -> publishable` publishes right away, and
    /// closing or archiving a published candidate goes through its posting.
    #[tracing::instrument(skip(self, reason), fields(actor = %actor))]
    pub fn patch_candidate(
        &self,
        actor: &Actor,
        id: CandidateId,
        next: CandidateState,
        reason: &str,
    ) -> Result<PostingCandidate> {
        actor.require(Capability::Moderate)?;
        self.transaction(|tx| {
            let mut candidate = self.candidates.load(tx, id)?;
            let from = candidate.state;
            match (from, next) {
                (
                    CandidateState::NeedsReview | CandidateState::Processed,
                    CandidateState::Publishable,
                ) => {
                    self.candidates.transition(tx, actor, &mut candidate, next, reason)?;
                    self.router.dismiss_reviews(tx, actor, id, reason)?;
                    self.postings.publish(tx, actor, &mut candidate)?;
                }
                (CandidateState::NeedsReview, CandidateState::Rejected) => {
                    self.candidates.transition(tx, actor, &mut candidate, next, reason)?;
                    self.router.dismiss_reviews(tx, actor, id, reason)?;
                }
                (CandidateState::Publishable, CandidateState::Published) => {
                    self.postings.publish(tx, actor, &mut candidate)?;
                }
                (CandidateState::Published, CandidateState::Closed | CandidateState::Archived) => {
                    let posting_id = owned_posting(&candidate)?;
                    let status = if next == CandidateState::Closed {
                        PostingStatus::Closed
                    } else {
                        PostingStatus::Archived
                    };
                    self.postings
                        .transition(tx, actor, posting_id, status, reason)?;
                    candidate = self.candidates.load(tx, id)?;
                }
                _ => {
                    self.candidates.transition(tx, actor, &mut candidate, next, reason)?;
                }
            }
            Ok(candidate)
        })
    }

    /// Manual merge of `secondary` into `primary`. Re-merging a merged pair
    /// returns the recorded decision.
    #[tracing::instrument(skip(self, reason), fields(actor = %actor))]
    pub fn merge_candidates(
        &self,
        actor: &Actor,
        primary_id: CandidateId,
        secondary_id: CandidateId,
        reason: &str,
    ) -> Result<MergeDecision> {
        actor.require(Capability::Moderate)?;
        self.transaction(|tx| {
            let mut primary = self.candidates.load(tx, primary_id)?;
            let mut secondary = self.candidates.load(tx, secondary_id)?;
            let confidence = self.router.scorer().score(&primary, &secondary).confidence;
            let decision = self.router.merge(
                tx,
                actor,
                &mut primary,
                &mut secondary,
                MergeDecisionKind::ManualMerged,
                confidence,
                reason,
            )?;
            if primary.state == CandidateState::Processed {
                let policy = self.policies.resolve(tx, &primary.source_key)?;
                self.router
                    .publish_or_review(tx, actor, &mut primary, &policy)?;
            }
            Ok(decision)
        })
    }

    /// Guarded posting transition; the candidate follows.
    pub fn patch_posting(
        &self,
        actor: &Actor,
        id: PostingId,
        next: PostingStatus,
        reason: &str,
    ) -> Result<Posting> {
        actor.require(Capability::Moderate)?;
        self.transaction(|tx| self.postings.transition(tx, actor, id, next, reason))
    }

    // ========================================
    // admin overrides
    // ========================================

    /// Sets a candidate's state outside the transition table.
    ///
    /// A candidate with a posting can only be moved together with it, so
    /// `posting_status` (or a published/closed/archived `next`) is applied
    /// to the posting first. `published` without a posting creates one.
    #[tracing::instrument(skip(self, reason), fields(actor = %actor))]
    pub fn override_candidate(
        &self,
        actor: &Actor,
        id: CandidateId,
        next: CandidateState,
        posting_status: Option<PostingStatus>,
        reason: &str,
    ) -> Result<PostingCandidate> {
        actor.require(Capability::Override)?;
        self.transaction(|tx| {
            let mut candidate = self.candidates.load(tx, id)?;
            let status = match posting_status {
                Some(status) => Some(status),
                None if candidate.owns_posting() => Some(mirrored_status(next)?),
                None => None,
            };

            match (status, candidate.posting_id) {
                (Some(status), Some(posting_id)) => {
                    if status.candidate_state() != next {
                        return Err(GleanerError::validation(format!(
                            "candidate state {next} does not match posting status {status}"
                        )));
                    }
                    self.postings
                        .override_status(tx, actor, posting_id, status, reason)?;
                    candidate = self.candidates.load(tx, id)?;
                }
                (Some(_), None) => {
                    return Err(GleanerError::validation(format!(
                        "candidate {id} has no posting to override"
                    )));
                }
                (None, _) if next == CandidateState::Published => {
                    self.candidates.override_state(
                        tx,
                        actor,
                        &mut candidate,
                        CandidateState::Publishable,
                        reason,
                    )?;
                    self.postings.publish(tx, actor, &mut candidate)?;
                }
                (None, _) => {
                    self.candidates
                        .override_state(tx, actor, &mut candidate, next, reason)?;
                }
            }
            Ok(candidate)
        })
    }

    /// The only path that reopens an `archived` or `closed` posting.
    pub fn override_posting(
        &self,
        actor: &Actor,
        id: PostingId,
        next: PostingStatus,
        reason: &str,
    ) -> Result<Posting> {
        actor.require(Capability::Override)?;
        self.transaction(|tx| self.postings.override_status(tx, actor, id, next, reason))
    }

    pub fn put_trust_policy(&self, actor: &Actor, policy: &TrustPolicy) -> Result<()> {
        actor.require(Capability::ManagePolicy)?;
        self.transaction(|tx| self.policies.put(tx, actor, policy))
    }

    // ========================================
    // reads
    // ========================================

    pub fn job(&self, id: JobId) -> Result<Job> {
        self.transaction(|tx| {
            tx.job(id)?
                .ok_or_else(|| GleanerError::not_found(EntityKind::Job, id))
        })
    }

    pub fn candidate(&self, id: CandidateId) -> Result<PostingCandidate> {
        self.transaction(|tx| self.candidates.load(tx, id))
    }

    pub fn posting(&self, id: PostingId) -> Result<Posting> {
        self.transaction(|tx| self.postings.load(tx, id))
    }

    /// The candidate a discovery was materialized into.
    pub fn candidate_for_discovery(&self, id: DiscoveryId) -> Result<Option<CandidateId>> {
        self.transaction(|tx| tx.candidate_for_discovery(id))
    }

    /// The posting a candidate, or the candidate it was merged into, owns.
    pub fn posting_for_candidate(&self, id: CandidateId) -> Result<Option<Posting>> {
        self.transaction(|tx| {
            let mut candidate = self.candidates.load(tx, id)?;
            if let Some(primary) = candidate.merged_into {
                candidate = self.candidates.load(tx, primary)?;
            }
            match candidate.posting_id {
                Some(posting_id) => Ok(Some(self.postings.load(tx, posting_id)?)),
                None => Ok(None),
            }
        })
    }

    pub fn discoveries_for_posting(&self, id: PostingId) -> Result<Vec<Discovery>> {
        self.transaction(|tx| {
            let posting = self.postings.load(tx, id)?;
            tx.discoveries_for_candidate(posting.candidate_id)?
                .into_iter()
                .map(|discovery_id| {
                    tx.discovery(discovery_id)?
                        .ok_or_else(|| GleanerError::not_found(EntityKind::Discovery, discovery_id))
                })
                .collect()
        })
    }

    pub fn merge_decision(&self, a: CandidateId, b: CandidateId) -> Result<Option<MergeDecision>> {
        self.transaction(|tx| tx.merge_decision_for_pair(a, b))
    }

    pub fn merge_decisions_for(&self, candidate: CandidateId) -> Result<Vec<MergeDecision>> {
        self.transaction(|tx| tx.merge_decisions_for(candidate))
    }

    pub fn events_for(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<ProvenanceEvent>> {
        self.transaction(|tx| tx.events_for(entity_type, entity_id))
    }

    pub fn trust_policy(&self, source_key: &str) -> Result<TrustPolicy> {
        self.transaction(|tx| self.policies.resolve(tx, source_key))
    }

    pub fn queue_counts(&self) -> Result<JobCounts> {
        self.transaction(|tx| tx.job_counts())
    }
}

fn owned_posting(candidate: &PostingCandidate) -> Result<PostingId> {
    candidate.posting_id.ok_or_else(|| {
        GleanerError::Fatal(format!(
            "candidate {} is {} without a posting",
            candidate.id, candidate.state
        ))
    })
}

/// Posting status a posted candidate's state corresponds to.
fn mirrored_status(state: CandidateState) -> Result<PostingStatus> {
    match state {
        CandidateState::Published => Ok(PostingStatus::Active),
        CandidateState::Archived => Ok(PostingStatus::Archived),
        CandidateState::Closed => Ok(PostingStatus::Closed),
        other => Err(GleanerError::validation(format!(
            "candidate owns a posting and cannot move to {other}"
        ))),
    }
}

fn check_inputs(kind: JobKind, raw: &serde_json::Value) -> Result<()> {
    fn decode<T: DeserializeOwned>(raw: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<T>(raw.clone())
            .map(|_| ())
            .map_err(|e| GleanerError::validation(format!("job inputs: {e}")))
    }
    match kind {
        JobKind::Extract => decode::<ExtractInput>(raw),
        JobKind::CheckFreshness => decode::<FreshnessInput>(raw),
        JobKind::Enrich => decode::<EnrichInput>(raw),
        JobKind::ResolveUrlRedirects => decode::<RedirectInput>(raw),
        JobKind::Dedupe => decode::<DedupeInput>(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn pipeline() -> Pipeline {
        let clock: Arc<dyn Clock> =
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        Pipeline::in_memory(&GleanerConfig::default(), clock)
    }

    #[test]
    fn moderator_cannot_override() {
        let p = pipeline();
        let err = p
            .override_posting(
                &Actor::moderator("m"),
                next_id(&UlidGenerator::new(p.clock().clone())),
                PostingStatus::Active,
                "reopen",
            )
            .unwrap_err();
        assert!(matches!(err, GleanerError::Forbidden { .. }));
    }

    #[test]
    fn ingest_rejects_non_http_urls_without_writing() {
        let p = pipeline();
        let err = p
            .ingest_discovery(&Actor::System, DiscoveryIntake::new("rss:x", "mailto:a@b.org", "h1"))
            .unwrap_err();
        assert!(matches!(err, GleanerError::Validation(_)));
        assert_eq!(p.queue_counts().unwrap(), JobCounts::default());
    }

    #[test]
    fn ingest_enqueues_one_extract_job() {
        let p = pipeline();
        let (discovery, job) = p
            .ingest_discovery(
                &Actor::System,
                DiscoveryIntake::new("rss:x", "https://www.x.org/jobs/1?utm_source=feed", "h1"),
            )
            .unwrap();
        assert_eq!(discovery.normalized_url, "https://x.org/jobs/1");
        assert_eq!(discovery.source_key, "rss:x");
        assert_eq!(job.kind, JobKind::Extract);
        assert_eq!(job.target_id, discovery.id.to_string());
        assert_eq!(p.queue_counts().unwrap().queued, 1);
    }

    #[test]
    fn enqueue_job_checks_inputs_for_the_kind() {
        let p = pipeline();
        let spec = NewJob::new(JobKind::Enrich, TargetType::Candidate, "cand-x")
            .with_inputs(json!({ "posting_id": "nope" }));
        let err = p.enqueue_job(&Actor::System, spec).unwrap_err();
        assert!(matches!(err, GleanerError::Validation(_)));
    }

    #[test]
    fn override_to_a_pre_publication_state_needs_no_posting() {
        let p = pipeline();
        let (_, job) = p
            .ingest_discovery(&Actor::System, DiscoveryIntake::new("rss:x", "https://x.org/a", "h1"))
            .unwrap();
        let worker = Actor::worker("w1");
        p.claim(&worker, job.id, 30).unwrap();
        p.submit_result(&worker, job.id, JobOutcome::done(json!({"fields": {"title": "Tutor"}})))
            .unwrap();

        let counts = p.queue_counts().unwrap();
        assert_eq!(counts.done, 1);
        let discovery_id: DiscoveryId = job.target_id.parse().unwrap();
        let candidate_id = p.candidate_for_discovery(discovery_id).unwrap().unwrap();

        let err = p
            .override_candidate(
                &Actor::admin("a"),
                candidate_id,
                CandidateState::NeedsReview,
                Some(PostingStatus::Active),
                "bad",
            )
            .unwrap_err();
        assert!(matches!(err, GleanerError::Validation(_)));

        let c = p
            .override_candidate(&Actor::admin("a"), candidate_id, CandidateState::Rejected, None, "spam")
            .unwrap();
        assert_eq!(c.state, CandidateState::Rejected);
    }
}
