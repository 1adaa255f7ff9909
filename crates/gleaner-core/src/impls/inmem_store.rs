//! InMemoryStore - 開発・テスト用の Store 実装
//!
//! テーブル全体を 1 つの `Mutex` で守り、`begin` で snapshot を複製して
//! その上で書き込みます。`commit` で snapshot を書き戻し、commit されずに
//! drop された場合は snapshot ごと捨てる（rollback）。
//!
//! トランザクションは直列化されるので、`compare_and_set_job` の
//! 前提条件チェックと書き込みの間に他の claimer が割り込むことはありません。
//!
//! 注意: `begin` のたびに全テーブルを clone するので、1 トランザクションの
//! コストは保持している状態全体の大きさに比例します (O(state))。
//! テストと demo 向けで、大量データの常駐には向きません。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::domain::{
    CandidateId, DecisionId, Discovery, DiscoveryId, EntityKind, EntityType, GleanerError, Job,
    JobCounts, JobFilter, JobId, JobKind, JobStatus, MergeDecision, Posting, PostingCandidate,
    PostingId, ProvenanceEvent, Result, TrustPolicy,
};
use crate::ports::{Store, Tx};

#[derive(Debug, Clone, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    discoveries: HashMap<DiscoveryId, Discovery>,
    candidates: HashMap<CandidateId, PostingCandidate>,
    /// Candidate ↔ discovery association rows, in insertion order.
    links: Vec<(CandidateId, DiscoveryId)>,
    postings: HashMap<PostingId, Posting>,
    postings_by_hash: HashMap<String, PostingId>,
    postings_by_candidate: HashMap<CandidateId, PostingId>,
    decisions: HashMap<DecisionId, MergeDecision>,
    decisions_by_pair: HashMap<(CandidateId, CandidateId), DecisionId>,
    policies: HashMap<String, TrustPolicy>,
    events: Vec<ProvenanceEvent>,
}

fn pair_key(a: CandidateId, b: CandidateId) -> (CandidateId, CandidateId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Transactional in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn Tx + '_>> {
        let guard = self
            .tables
            .lock()
            .map_err(|_| GleanerError::Storage("in-memory store lock poisoned".into()))?;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTx { guard, staged }))
    }
}

struct InMemoryTx<'a> {
    guard: MutexGuard<'a, Tables>,
    staged: Tables,
}

impl Tx for InMemoryTx<'_> {
    fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    // ---- jobs ----

    fn insert_job(&mut self, job: &Job) -> Result<()> {
        if self.staged.jobs.contains_key(&job.id) {
            return Err(GleanerError::Fatal(format!("duplicate job id {}", job.id)));
        }
        self.staged.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.staged.jobs.get(&id).cloned())
    }

    fn compare_and_set_job(&mut self, expected: (JobStatus, u32), job: &Job) -> Result<bool> {
        let Some(row) = self.staged.jobs.get_mut(&job.id) else {
            return Err(GleanerError::not_found(EntityKind::Job, job.id));
        };
        if (row.status, row.attempt) != expected {
            return Ok(false);
        }
        *row = job.clone();
        Ok(true)
    }

    fn claimable_jobs(&self, now: DateTime<Utc>, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .staged
            .jobs
            .values()
            .filter(|j| j.is_claimable(now) && filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.next_run_at, j.id));
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .staged
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    fn pending_jobs_for(&self, kind: JobKind, target_id: &str) -> Result<Vec<Job>> {
        Ok(self
            .staged
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.target_id == target_id && j.status.is_pending())
            .cloned()
            .collect())
    }

    fn job_counts(&self) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.staged.jobs.values() {
            counts.record(job.status);
        }
        Ok(counts)
    }

    // ---- discoveries ----

    fn insert_discovery(&mut self, discovery: &Discovery) -> Result<()> {
        if self.staged.discoveries.contains_key(&discovery.id) {
            return Err(GleanerError::Fatal(format!(
                "discovery {} is append-only and already exists",
                discovery.id
            )));
        }
        self.staged.discoveries.insert(discovery.id, discovery.clone());
        Ok(())
    }

    fn discovery(&self, id: DiscoveryId) -> Result<Option<Discovery>> {
        Ok(self.staged.discoveries.get(&id).cloned())
    }

    // ---- candidates ----

    fn insert_candidate(&mut self, candidate: &PostingCandidate) -> Result<()> {
        if self.staged.candidates.contains_key(&candidate.id) {
            return Err(GleanerError::Fatal(format!("duplicate candidate id {}", candidate.id)));
        }
        self.staged.candidates.insert(candidate.id, candidate.clone());
        Ok(())
    }

    fn candidate(&self, id: CandidateId) -> Result<Option<PostingCandidate>> {
        Ok(self.staged.candidates.get(&id).cloned())
    }

    fn save_candidate(&mut self, candidate: &PostingCandidate) -> Result<()> {
        let row = self
            .staged
            .candidates
            .get_mut(&candidate.id)
            .ok_or_else(|| GleanerError::not_found(EntityKind::Candidate, candidate.id))?;
        *row = candidate.clone();
        Ok(())
    }

    fn candidates_in_bucket(&self, bucket_key: &str) -> Result<Vec<PostingCandidate>> {
        let mut found: Vec<PostingCandidate> = self
            .staged
            .candidates
            .values()
            .filter(|c| c.dedupe_bucket_key == bucket_key)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.id);
        Ok(found)
    }

    fn link_discovery(&mut self, candidate: CandidateId, discovery: DiscoveryId) -> Result<()> {
        if !self.staged.candidates.contains_key(&candidate) {
            return Err(GleanerError::not_found(EntityKind::Candidate, candidate));
        }
        if !self.staged.discoveries.contains_key(&discovery) {
            return Err(GleanerError::not_found(EntityKind::Discovery, discovery));
        }
        if !self.staged.links.contains(&(candidate, discovery)) {
            self.staged.links.push((candidate, discovery));
        }
        Ok(())
    }

    fn discoveries_for_candidate(&self, candidate: CandidateId) -> Result<Vec<DiscoveryId>> {
        Ok(self
            .staged
            .links
            .iter()
            .filter(|(c, _)| *c == candidate)
            .map(|(_, d)| *d)
            .collect())
    }

    fn candidate_for_discovery(&self, discovery: DiscoveryId) -> Result<Option<CandidateId>> {
        Ok(self
            .staged
            .links
            .iter()
            .find(|(_, d)| *d == discovery)
            .map(|(c, _)| *c))
    }

    // ---- postings ----

    fn insert_posting(&mut self, posting: &Posting) -> Result<()> {
        if self.staged.postings_by_hash.contains_key(&posting.canonical_hash) {
            return Err(GleanerError::Fatal(format!(
                "unique constraint: canonical_hash {} already present",
                posting.canonical_hash
            )));
        }
        if self.staged.postings_by_candidate.contains_key(&posting.candidate_id) {
            return Err(GleanerError::Fatal(format!(
                "unique constraint: candidate {} already owns a posting",
                posting.candidate_id
            )));
        }
        self.staged
            .postings_by_hash
            .insert(posting.canonical_hash.clone(), posting.id);
        self.staged
            .postings_by_candidate
            .insert(posting.candidate_id, posting.id);
        self.staged.postings.insert(posting.id, posting.clone());
        Ok(())
    }

    fn posting(&self, id: PostingId) -> Result<Option<Posting>> {
        Ok(self.staged.postings.get(&id).cloned())
    }

    fn save_posting(&mut self, posting: &Posting) -> Result<()> {
        let Some(previous) = self.staged.postings.get(&posting.id) else {
            return Err(GleanerError::not_found(EntityKind::Posting, posting.id));
        };
        if previous.candidate_id != posting.candidate_id {
            return Err(GleanerError::Fatal(format!(
                "posting {} cannot move between candidates",
                posting.id
            )));
        }
        if previous.canonical_hash != posting.canonical_hash {
            if self.staged.postings_by_hash.contains_key(&posting.canonical_hash) {
                return Err(GleanerError::Fatal(format!(
                    "unique constraint: canonical_hash {} already present",
                    posting.canonical_hash
                )));
            }
            let old = previous.canonical_hash.clone();
            self.staged.postings_by_hash.remove(&old);
            self.staged
                .postings_by_hash
                .insert(posting.canonical_hash.clone(), posting.id);
        }
        self.staged.postings.insert(posting.id, posting.clone());
        Ok(())
    }

    fn posting_by_hash(&self, canonical_hash: &str) -> Result<Option<Posting>> {
        Ok(self
            .staged
            .postings_by_hash
            .get(canonical_hash)
            .and_then(|id| self.staged.postings.get(id))
            .cloned())
    }

    fn postings_due(&self, cutoff: DateTime<Utc>) -> Result<Vec<Posting>> {
        let mut due: Vec<Posting> = self
            .staged
            .postings
            .values()
            .filter(|p| p.due_for_freshness(cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.id);
        Ok(due)
    }

    // ---- merge decisions ----

    fn insert_merge_decision(&mut self, decision: &MergeDecision) -> Result<()> {
        let key = pair_key(decision.primary_candidate_id, decision.secondary_candidate_id);
        if self.staged.decisions_by_pair.contains_key(&key) {
            return Err(GleanerError::Fatal(format!(
                "unique constraint: decision for ({}, {}) already present",
                decision.primary_candidate_id, decision.secondary_candidate_id
            )));
        }
        self.staged.decisions_by_pair.insert(key, decision.id);
        self.staged.decisions.insert(decision.id, decision.clone());
        Ok(())
    }

    fn save_merge_decision(&mut self, decision: &MergeDecision) -> Result<()> {
        let row = self
            .staged
            .decisions
            .get_mut(&decision.id)
            .ok_or_else(|| GleanerError::not_found(EntityKind::MergeDecision, decision.id))?;
        if !row.involves(decision.primary_candidate_id, decision.secondary_candidate_id) {
            return Err(GleanerError::Fatal(format!(
                "merge decision {} cannot change its candidate pair",
                decision.id
            )));
        }
        *row = decision.clone();
        Ok(())
    }

    fn merge_decision_for_pair(
        &self,
        a: CandidateId,
        b: CandidateId,
    ) -> Result<Option<MergeDecision>> {
        Ok(self
            .staged
            .decisions_by_pair
            .get(&pair_key(a, b))
            .and_then(|id| self.staged.decisions.get(id))
            .cloned())
    }

    fn merge_decisions_for(&self, candidate: CandidateId) -> Result<Vec<MergeDecision>> {
        let mut found: Vec<MergeDecision> = self
            .staged
            .decisions
            .values()
            .filter(|d| {
                d.primary_candidate_id == candidate || d.secondary_candidate_id == candidate
            })
            .cloned()
            .collect();
        found.sort_by_key(|d| d.id);
        Ok(found)
    }

    // ---- trust policies ----

    fn trust_policy(&self, source_key: &str) -> Result<Option<TrustPolicy>> {
        Ok(self.staged.policies.get(source_key).cloned())
    }

    fn put_trust_policy(&mut self, policy: &TrustPolicy) -> Result<()> {
        self.staged
            .policies
            .insert(policy.source_key.clone(), policy.clone());
        Ok(())
    }

    // ---- provenance ----

    fn append_event(&mut self, event: &ProvenanceEvent) -> Result<()> {
        if self.staged.events.iter().any(|e| e.id == event.id) {
            return Err(GleanerError::Fatal(format!("duplicate event id {}", event.id)));
        }
        self.staged.events.push(event.clone());
        Ok(())
    }

    fn events_for(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<ProvenanceEvent>> {
        Ok(self
            .staged
            .events
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExtractedFields, JobKind, NewJob, PostingStatus, TargetType};
    use crate::ports::in_transaction;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn job() -> Job {
        Job::new(
            JobId::from_ulid(Ulid::new()),
            NewJob::new(JobKind::Extract, TargetType::Discovery, "disc-x"),
            3,
            t0(),
        )
    }

    fn posting(candidate: CandidateId, hash: &str) -> Posting {
        Posting {
            id: PostingId::from_ulid(Ulid::new()),
            candidate_id: candidate,
            canonical_hash: hash.into(),
            status: PostingStatus::Active,
            url: "https://example.org/a".into(),
            fields: ExtractedFields::default(),
            last_checked_at: None,
            freshness_failures: 0,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    #[test]
    fn committed_writes_are_visible() {
        let store = InMemoryStore::new();
        let j = job();
        in_transaction(&store, |tx| tx.insert_job(&j)).unwrap();
        let read = in_transaction(&store, |tx| tx.job(j.id)).unwrap();
        assert_eq!(read, Some(j));
    }

    #[test]
    fn failed_unit_of_work_rolls_back() {
        let store = InMemoryStore::new();
        let j = job();
        let res: Result<()> = in_transaction(&store, |tx| {
            tx.insert_job(&j)?;
            Err(GleanerError::validation("boom"))
        });
        assert!(res.is_err());
        assert!(in_transaction(&store, |tx| tx.job(j.id)).unwrap().is_none());
    }

    #[test]
    fn compare_and_set_only_applies_once() {
        let store = InMemoryStore::new();
        let j = job();
        in_transaction(&store, |tx| tx.insert_job(&j)).unwrap();

        let mut claimed = j.clone();
        claimed.claim("w1", t0(), t0());
        let first = in_transaction(&store, |tx| {
            tx.compare_and_set_job((JobStatus::Queued, 0), &claimed)
        })
        .unwrap();
        let second = in_transaction(&store, |tx| {
            tx.compare_and_set_job((JobStatus::Queued, 0), &claimed)
        })
        .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn duplicate_canonical_hash_is_fatal() {
        let store = InMemoryStore::new();
        let a = CandidateId::from_ulid(Ulid::new());
        let b = CandidateId::from_ulid(Ulid::new());
        in_transaction(&store, |tx| tx.insert_posting(&posting(a, "h1"))).unwrap();
        let err = in_transaction(&store, |tx| tx.insert_posting(&posting(b, "h1"))).unwrap_err();
        assert!(matches!(err, GleanerError::Fatal(_)));
    }

    #[test]
    fn pair_lookup_ignores_order() {
        let store = InMemoryStore::new();
        let a = CandidateId::from_ulid(Ulid::new());
        let b = CandidateId::from_ulid(Ulid::new());
        let d = MergeDecision {
            id: DecisionId::from_ulid(Ulid::new()),
            primary_candidate_id: a,
            secondary_candidate_id: b,
            decision: crate::domain::MergeDecisionKind::NeedsReview,
            confidence: 0.8,
            decided_by: "system".into(),
            rationale: String::new(),
            created_at: t0(),
            updated_at: t0(),
        };
        in_transaction(&store, |tx| tx.insert_merge_decision(&d)).unwrap();
        let found = in_transaction(&store, |tx| tx.merge_decision_for_pair(b, a)).unwrap();
        assert_eq!(found.map(|f| f.id), Some(d.id));

        let mut swapped = d.clone();
        swapped.id = DecisionId::from_ulid(Ulid::new());
        swapped.primary_candidate_id = b;
        swapped.secondary_candidate_id = a;
        let err = in_transaction(&store, |tx| tx.insert_merge_decision(&swapped)).unwrap_err();
        assert!(matches!(err, GleanerError::Fatal(_)));
    }
}
