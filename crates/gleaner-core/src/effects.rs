//! Job result effects
//!
//! `JobLedger::submit_result` が job 行を確定させたあと、同じ `Tx` の中で
//! ここが candidate / posting 側の状態を進めます。どちらかが失敗すれば
//! 全体がロールバックされるので、ledger とドメインの状態がずれることはありません。

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;

use crate::dedupe::{bucket_key, canonical_url};
use crate::domain::{
    Actor, CandidateState, DedupeInput, EnrichInput, EnrichResult, EntityKind, ExtractInput,
    ExtractResult, FreshnessInput, GleanerError, Job, JobKind, JobResult, PostingCandidate,
    RedirectInput, RedirectResult, Result,
};
use crate::ledger::JobEffects;
use crate::lifecycle::{CandidateMachine, Liveness, PostingLifecycle};
use crate::ports::{Clock, IdGenerator, Tx, next_id};
use crate::router::MergeRouter;

#[derive(Clone)]
pub struct DomainEffects {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    candidates: CandidateMachine,
    postings: PostingLifecycle,
    router: MergeRouter,
}

impl DomainEffects {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        candidates: CandidateMachine,
        postings: PostingLifecycle,
        router: MergeRouter,
    ) -> Self {
        Self {
            clock,
            ids,
            candidates,
            postings,
            router,
        }
    }

    /// Materializes the candidate for an extracted discovery and routes it.
    fn apply_extract(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        job: &Job,
        result: &ExtractResult,
    ) -> Result<()> {
        let input: ExtractInput = inputs(job)?;
        let discovery = tx
            .discovery(input.discovery_id)?
            .ok_or_else(|| GleanerError::not_found(EntityKind::Discovery, input.discovery_id))?;
        if let Some(existing) = tx.candidate_for_discovery(discovery.id)? {
            tracing::debug!(discovery_id = %discovery.id, candidate_id = %existing, "discovery already materialized");
            return Ok(());
        }

        let mut candidate = PostingCandidate::new(
            next_id(self.ids.as_ref()),
            discovery.source_key.clone(),
            discovery.normalized_url.clone(),
            bucket_key(&discovery.normalized_url),
            self.clock.now(),
        );
        candidate
            .evidence
            .urls
            .insert(discovery.normalized_url.clone());
        candidate
            .evidence
            .content_hashes
            .insert(discovery.canonical_hash.clone());
        candidate.extracted_fields = result.fields.clone();
        candidate.add_risk_flags(&result.risk_flags);

        self.candidates.create(tx, actor, &candidate, discovery.id)?;
        self.candidates
            .transition(tx, actor, &mut candidate, CandidateState::Processed, "extracted")?;
        self.router.route(tx, actor, candidate.id)?;
        Ok(())
    }

    fn apply_enrich(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        job: &Job,
        result: &EnrichResult,
    ) -> Result<()> {
        let input: EnrichInput = inputs(job)?;
        let mut candidate = self.candidates.load(tx, input.candidate_id)?;
        if candidate.state.is_terminal() {
            tracing::debug!(candidate_id = %candidate.id, state = %candidate.state, "enrich result for resolved candidate ignored");
            return Ok(());
        }
        candidate.extracted_fields.fill_missing_from(&result.fields);
        candidate.add_risk_flags(&result.risk_flags);
        self.candidates.update_content(
            tx,
            actor,
            &mut candidate,
            "candidate.enriched",
            json!({ "job_id": job.id, "risk_flags": result.risk_flags }),
        )?;
        self.postings.refresh_content(tx, actor, &candidate)?;
        if reroutable(candidate.state) {
            self.router.route(tx, actor, candidate.id)?;
        }
        Ok(())
    }

    fn apply_redirect(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        job: &Job,
        result: &RedirectResult,
    ) -> Result<()> {
        let input: RedirectInput = inputs(job)?;
        let mut candidate = self.candidates.load(tx, input.candidate_id)?;
        if candidate.state.is_terminal() {
            return Ok(());
        }
        let resolved = canonical_url(&result.resolved_url)
            .unwrap_or_else(|| result.resolved_url.clone());
        let previous = std::mem::replace(&mut candidate.canonical_url, resolved.clone());
        candidate.evidence.urls.insert(resolved.clone());
        candidate.dedupe_bucket_key = bucket_key(&resolved);
        let payload = json!({
            "from": previous,
            "to": resolved,
            "dedupe_bucket_key": candidate.dedupe_bucket_key,
        });
        self.candidates.update_content(
            tx,
            actor,
            &mut candidate,
            "candidate.url_resolved",
            payload,
        )?;
        self.postings.refresh_content(tx, actor, &candidate)?;
        if reroutable(candidate.state) {
            self.router.route(tx, actor, candidate.id)?;
        }
        Ok(())
    }

    fn apply_liveness(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job, liveness: Liveness) -> Result<()> {
        let input: FreshnessInput = inputs(job)?;
        self.postings
            .apply_liveness(tx, actor, input.posting_id, liveness)?;
        Ok(())
    }
}

impl JobEffects for DomainEffects {
    fn on_done(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job, result: &JobResult) -> Result<()> {
        match result {
            JobResult::Extract(r) => self.apply_extract(tx, actor, job, r),
            JobResult::CheckFreshness(r) => {
                let liveness = if r.alive {
                    Liveness::Alive
                } else {
                    Liveness::Failed
                };
                self.apply_liveness(tx, actor, job, liveness)
            }
            JobResult::Enrich(r) => self.apply_enrich(tx, actor, job, r),
            JobResult::ResolveUrlRedirects(r) => self.apply_redirect(tx, actor, job, r),
            JobResult::Dedupe(_) => {
                let input: DedupeInput = inputs(job)?;
                self.router.route(tx, actor, input.candidate_id)?;
                Ok(())
            }
        }
    }

    fn on_retry_scheduled(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job) -> Result<()> {
        if job.kind == JobKind::CheckFreshness {
            return self.apply_liveness(tx, actor, job, Liveness::Failed);
        }
        Ok(())
    }

    fn on_dead_letter(&self, tx: &mut dyn Tx, actor: &Actor, job: &Job) -> Result<()> {
        if job.kind == JobKind::CheckFreshness {
            return self.apply_liveness(tx, actor, job, Liveness::Exhausted);
        }
        tracing::warn!(job_id = %job.id, kind = %job.kind, target_id = %job.target_id, "job dead-lettered without domain effect");
        Ok(())
    }
}

/// A `needs_review` candidate is routed again too: new fields or a new
/// bucket can turn up an auto-merge, new risk flags rule one out.
fn reroutable(state: CandidateState) -> bool {
    matches!(state, CandidateState::Processed | CandidateState::NeedsReview)
}

fn inputs<T: DeserializeOwned>(job: &Job) -> Result<T> {
    serde_json::from_value(job.inputs.clone()).map_err(|e| {
        GleanerError::Fatal(format!("job {} ({}) has malformed inputs: {e}", job.id, job.kind))
    })
}
