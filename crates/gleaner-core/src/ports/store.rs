//! Store port - トランザクション単位の永続化
//!
//! 6 つのテーブル（jobs, posting_candidates, postings,
//! candidate_merge_decisions, source_trust_policy, provenance_events）と
//! candidate ↔ discovery の関連テーブルを 1 つの `Tx` で扱います。
//!
//! # 設計原則
//! - 1 つのトリガー（submit_result, moderator の操作など）= 1 トランザクション
//! - `commit` されなかった `Tx` は drop 時にすべて破棄される（rollback）
//! - claim / reap は `compare_and_set_job` の条件付き更新だけで行う
//!   （read-then-write で状態を確定させない）
//! - unique 制約（posting.canonical_hash, posting.candidate_id,
//!   merge decision の pair）の違反は `GleanerError::Fatal`

use chrono::{DateTime, Utc};

use crate::domain::{
    CandidateId, Discovery, DiscoveryId, EntityType, Job, JobCounts, JobFilter, JobId, JobKind,
    JobStatus, MergeDecision, Posting, PostingCandidate, PostingId, ProvenanceEvent, Result,
    TrustPolicy,
};

pub trait Store: Send + Sync {
    /// Opens a unit of work. Writes become visible only after `Tx::commit`.
    fn begin(&self) -> Result<Box<dyn Tx + '_>>;
}

/// Runs `f` inside one transaction, committing only when it returns `Ok`.
pub fn in_transaction<T>(
    store: &dyn Store,
    f: impl FnOnce(&mut dyn Tx) -> Result<T>,
) -> Result<T> {
    let mut tx = store.begin()?;
    let out = f(tx.as_mut())?;
    tx.commit()?;
    Ok(out)
}

pub trait Tx {
    fn commit(self: Box<Self>) -> Result<()>;

    // ---- jobs ----
    fn insert_job(&mut self, job: &Job) -> Result<()>;
    fn job(&self, id: JobId) -> Result<Option<Job>>;
    /// Writes `job` only if the stored row still has `expected` status and
    /// attempt count. Returns `false` when the precondition did not hold.
    fn compare_and_set_job(&mut self, expected: (JobStatus, u32), job: &Job) -> Result<bool>;
    /// Queued jobs due at `now`, oldest `next_run_at` first.
    fn claimable_jobs(&self, now: DateTime<Utc>, filter: &JobFilter) -> Result<Vec<Job>>;
    /// Claimed jobs whose lease ended before `now`.
    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;
    /// Non-terminal jobs of `kind` pointing at `target_id`.
    fn pending_jobs_for(&self, kind: JobKind, target_id: &str) -> Result<Vec<Job>>;
    fn job_counts(&self) -> Result<JobCounts>;

    // ---- discoveries (read side; inserts come from ingest) ----
    fn insert_discovery(&mut self, discovery: &Discovery) -> Result<()>;
    fn discovery(&self, id: DiscoveryId) -> Result<Option<Discovery>>;

    // ---- candidates ----
    fn insert_candidate(&mut self, candidate: &PostingCandidate) -> Result<()>;
    fn candidate(&self, id: CandidateId) -> Result<Option<PostingCandidate>>;
    fn save_candidate(&mut self, candidate: &PostingCandidate) -> Result<()>;
    fn candidates_in_bucket(&self, bucket_key: &str) -> Result<Vec<PostingCandidate>>;
    /// Adds a candidate ↔ discovery link. Existing links are kept as is.
    fn link_discovery(&mut self, candidate: CandidateId, discovery: DiscoveryId) -> Result<()>;
    fn discoveries_for_candidate(&self, candidate: CandidateId) -> Result<Vec<DiscoveryId>>;
    fn candidate_for_discovery(&self, discovery: DiscoveryId) -> Result<Option<CandidateId>>;

    // ---- postings ----
    fn insert_posting(&mut self, posting: &Posting) -> Result<()>;
    fn posting(&self, id: PostingId) -> Result<Option<Posting>>;
    fn save_posting(&mut self, posting: &Posting) -> Result<()>;
    fn posting_by_hash(&self, canonical_hash: &str) -> Result<Option<Posting>>;
    /// Live postings not checked since `cutoff`.
    fn postings_due(&self, cutoff: DateTime<Utc>) -> Result<Vec<Posting>>;

    // ---- merge decisions ----
    fn insert_merge_decision(&mut self, decision: &MergeDecision) -> Result<()>;
    fn save_merge_decision(&mut self, decision: &MergeDecision) -> Result<()>;
    /// The decision recorded for `a` and `b`, in either order.
    fn merge_decision_for_pair(&self, a: CandidateId, b: CandidateId)
    -> Result<Option<MergeDecision>>;
    fn merge_decisions_for(&self, candidate: CandidateId) -> Result<Vec<MergeDecision>>;

    // ---- trust policies ----
    fn trust_policy(&self, source_key: &str) -> Result<Option<TrustPolicy>>;
    fn put_trust_policy(&mut self, policy: &TrustPolicy) -> Result<()>;

    // ---- provenance ----
    fn append_event(&mut self, event: &ProvenanceEvent) -> Result<()>;
    fn events_for(&self, entity_type: EntityType, entity_id: &str)
    -> Result<Vec<ProvenanceEvent>>;
}
