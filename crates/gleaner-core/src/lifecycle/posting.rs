//! Posting Lifecycle Manager
//!
//! `Posting.status` を書き換えるのはこのモジュールだけです。
//! すべての遷移は同じ `Tx` の中で紐づく candidate の state を同期します
//! （active|stale → published, archived → archived, closed → closed）。
//!
//! archived / closed からの再開は通常の遷移では拒否し、
//! `override_status`（posting.overridden として別記録）だけが許可します。

use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::dedupe::normalize_url;
use crate::domain::{
    Actor, CandidateState, ConflictKind, EntityKind, EntityType, GleanerError, NewEvent, Posting,
    PostingCandidate, PostingId, PostingStatus, Result,
};
use crate::lifecycle::candidate::CandidateMachine;
use crate::ports::{Clock, IdGenerator, Tx, next_id};
use crate::provenance::ProvenanceRecorder;

/// What a freshness check reported for a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// One failed check; more attempts may follow.
    Failed,
    /// The check job gave up (dead-lettered).
    Exhausted,
}

#[derive(Clone)]
pub struct PostingLifecycle {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    provenance: ProvenanceRecorder,
    candidates: CandidateMachine,
}

impl PostingLifecycle {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        provenance: ProvenanceRecorder,
        candidates: CandidateMachine,
    ) -> Self {
        Self {
            clock,
            ids,
            provenance,
            candidates,
        }
    }

    pub fn load(&self, tx: &dyn Tx, id: PostingId) -> Result<Posting> {
        tx.posting(id)?
            .ok_or_else(|| GleanerError::not_found(EntityKind::Posting, id))
    }

    /// Hash a candidate's posting will be unique on.
    pub fn canonical_hash_for(candidate: &PostingCandidate) -> String {
        if let Some(hash) = candidate.evidence.content_hashes.iter().next() {
            return hash.clone();
        }
        let fields = &candidate.extracted_fields;
        let url = normalize_url(&candidate.canonical_url)
            .unwrap_or_else(|| candidate.canonical_url.clone());
        let mut hasher = Sha256::new();
        for part in [
            url.as_str(),
            fields.title.as_deref().unwrap_or_default(),
            fields.organization.as_deref().unwrap_or_default(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Another candidate's posting already holding this candidate's hash, if any.
    pub fn hash_owner(&self, tx: &dyn Tx, candidate: &PostingCandidate) -> Result<Option<Posting>> {
        let hash = Self::canonical_hash_for(candidate);
        Ok(tx
            .posting_by_hash(&hash)?
            .filter(|p| p.candidate_id != candidate.id))
    }

    /// Creates the candidate's posting (once) and moves it to `published`.
    ///
    /// A candidate that already owns a posting gets that posting back.
    pub fn publish(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
    ) -> Result<Posting> {
        if let Some(existing) = candidate.posting_id {
            let posting = self.load(tx, existing)?;
            if candidate.state == CandidateState::Publishable {
                self.candidates.transition(
                    tx,
                    actor,
                    candidate,
                    CandidateState::Published,
                    "posting already exists",
                )?;
            }
            return Ok(posting);
        }
        if candidate.state != CandidateState::Publishable {
            return Err(GleanerError::conflict(
                ConflictKind::IllegalTransition,
                EntityKind::Candidate,
                candidate.id,
                candidate.state,
                CandidateState::Published,
            ));
        }

        let canonical_hash = Self::canonical_hash_for(candidate);
        if let Some(owner) = tx.posting_by_hash(&canonical_hash)? {
            return Err(GleanerError::conflict(
                ConflictKind::CanonicalHashTaken,
                EntityKind::Posting,
                owner.id,
                format!("owned by {}", owner.candidate_id),
                format!("create for {}", candidate.id),
            ));
        }

        let now = self.clock.now();
        let posting = Posting {
            id: next_id(self.ids.as_ref()),
            candidate_id: candidate.id,
            canonical_hash,
            status: PostingStatus::Active,
            url: candidate.canonical_url.clone(),
            fields: candidate.extracted_fields.clone(),
            last_checked_at: None,
            freshness_failures: 0,
            created_at: now,
            updated_at: now,
        };
        tx.insert_posting(&posting)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Posting, posting.id, "posting.created").with_payload(json!({
                "candidate_id": candidate.id,
                "canonical_hash": posting.canonical_hash,
                "status": posting.status,
            })),
        )?;

        candidate.posting_id = Some(posting.id);
        self.candidates.transition(
            tx,
            actor,
            candidate,
            CandidateState::Published,
            "posting created",
        )?;
        tracing::info!(posting_id = %posting.id, candidate_id = %candidate.id, "posting published");
        Ok(posting)
    }

    /// Guarded status transition, synchronising the candidate.
    pub fn transition(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        posting_id: PostingId,
        next: PostingStatus,
        reason: &str,
    ) -> Result<Posting> {
        let mut posting = self.load(tx, posting_id)?;
        self.apply_transition(tx, actor, &mut posting, next, reason)?;
        Ok(posting)
    }

    /// The explicit administrative path: any status, including reopening
    /// `archived` / `closed` postings.
    pub fn override_status(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        posting_id: PostingId,
        next: PostingStatus,
        reason: &str,
    ) -> Result<Posting> {
        let mut posting = self.load(tx, posting_id)?;
        let from = posting.status;
        posting.status = next;
        posting.updated_at = self.clock.now();
        tx.save_posting(&posting)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Posting, posting.id, "posting.overridden")
                .with_payload(json!({ "from": from, "to": next, "reason": reason })),
        )?;
        tracing::warn!(posting_id = %posting.id, %from, to = %next, %actor, "posting status overridden");

        let mut candidate = self.candidates.load(tx, posting.candidate_id)?;
        let target = next.candidate_state();
        if candidate.state != target {
            self.candidates
                .override_state(tx, actor, &mut candidate, target, reason)?;
        }
        Ok(posting)
    }

    /// Copies the candidate's current content onto its posting, in place.
    pub fn refresh_content(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &PostingCandidate,
    ) -> Result<Option<Posting>> {
        let Some(posting_id) = candidate.posting_id else {
            return Ok(None);
        };
        let mut posting = self.load(tx, posting_id)?;
        if posting.fields == candidate.extracted_fields && posting.url == candidate.canonical_url {
            return Ok(Some(posting));
        }
        posting.fields = candidate.extracted_fields.clone();
        posting.url = candidate.canonical_url.clone();
        posting.updated_at = self.clock.now();
        tx.save_posting(&posting)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Posting, posting.id, "posting.content_updated")
                .with_payload(json!({ "candidate_id": candidate.id, "url": posting.url })),
        )?;
        Ok(Some(posting))
    }

    /// Applies a freshness result.
    ///
    /// - `Alive`: `stale -> active`, failure count reset
    /// - `Failed`: `active -> stale` (already stale stays stale)
    /// - `Exhausted`: `stale -> archived`, passing through `stale` when still active
    ///
    /// Postings already archived or closed are left untouched.
    pub fn apply_liveness(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        posting_id: PostingId,
        liveness: Liveness,
    ) -> Result<Posting> {
        let mut posting = self.load(tx, posting_id)?;
        if !posting.is_live() {
            tracing::debug!(posting_id = %posting_id, status = %posting.status, ?liveness, "freshness result for closed posting ignored");
            return Ok(posting);
        }
        let now = self.clock.now();
        posting.last_checked_at = Some(now);

        match liveness {
            Liveness::Alive => {
                posting.freshness_failures = 0;
                if posting.status == PostingStatus::Stale {
                    self.apply_transition(tx, actor, &mut posting, PostingStatus::Active, "liveness restored")?;
                } else {
                    posting.updated_at = now;
                    tx.save_posting(&posting)?;
                }
            }
            Liveness::Failed => {
                posting.freshness_failures += 1;
                if posting.status == PostingStatus::Active {
                    self.apply_transition(tx, actor, &mut posting, PostingStatus::Stale, "liveness check failed")?;
                } else {
                    posting.updated_at = now;
                    tx.save_posting(&posting)?;
                }
            }
            Liveness::Exhausted => {
                posting.freshness_failures += 1;
                if posting.status == PostingStatus::Active {
                    self.apply_transition(tx, actor, &mut posting, PostingStatus::Stale, "liveness check failed")?;
                }
                self.apply_transition(
                    tx,
                    actor,
                    &mut posting,
                    PostingStatus::Archived,
                    "liveness retries exhausted",
                )?;
            }
        }
        Ok(posting)
    }

    fn apply_transition(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        posting: &mut Posting,
        next: PostingStatus,
        reason: &str,
    ) -> Result<()> {
        let from = posting.status;
        if !from.can_transition_to(next) {
            return Err(GleanerError::conflict(
                ConflictKind::IllegalTransition,
                EntityKind::Posting,
                posting.id,
                from,
                next,
            ));
        }
        posting.status = next;
        posting.updated_at = self.clock.now();
        tx.save_posting(posting)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Posting, posting.id, "posting.status_changed")
                .with_payload(json!({ "from": from, "to": next, "reason": reason })),
        )?;
        tracing::info!(posting_id = %posting.id, %from, to = %next, reason, "posting transitioned");

        let mut candidate = self.candidates.load(tx, posting.candidate_id)?;
        self.candidates
            .follow_posting(tx, actor, &mut candidate, next, reason)
    }
}
