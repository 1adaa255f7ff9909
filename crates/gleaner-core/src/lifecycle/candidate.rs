//! Candidate State Machine
//!
//! `PostingCandidate.state` を書き換えるのはこのモジュールだけです。
//! 通常の遷移は `CandidateState::can_transition_to` の表で検査し、
//! merge による吸収と管理者の override はそれぞれ別のイベント種別で記録します。

use std::sync::Arc;

use serde_json::json;

use crate::domain::{
    Actor, CandidateId, CandidateState, ConflictKind, DiscoveryId, EntityKind, EntityType,
    GleanerError, NewEvent, PostingCandidate, PostingStatus, Result,
};
use crate::ports::{Clock, Tx};
use crate::provenance::ProvenanceRecorder;

#[derive(Clone)]
pub struct CandidateMachine {
    clock: Arc<dyn Clock>,
    provenance: ProvenanceRecorder,
}

impl CandidateMachine {
    pub fn new(clock: Arc<dyn Clock>, provenance: ProvenanceRecorder) -> Self {
        Self { clock, provenance }
    }

    pub fn load(&self, tx: &dyn Tx, id: CandidateId) -> Result<PostingCandidate> {
        tx.candidate(id)?
            .ok_or_else(|| GleanerError::not_found(EntityKind::Candidate, id))
    }

    /// Inserts a `discovered` candidate linked to its first discovery.
    pub fn create(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &PostingCandidate,
        discovery: DiscoveryId,
    ) -> Result<()> {
        if candidate.state != CandidateState::Discovered {
            return Err(GleanerError::Fatal(format!(
                "candidate {} must start as discovered, not {}",
                candidate.id, candidate.state
            )));
        }
        tx.insert_candidate(candidate)?;
        tx.link_discovery(candidate.id, discovery)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Candidate, candidate.id, "candidate.created").with_payload(
                json!({
                    "discovery_id": discovery,
                    "source_key": candidate.source_key,
                    "dedupe_bucket_key": candidate.dedupe_bucket_key,
                }),
            ),
        )?;
        Ok(())
    }

    /// Guarded lifecycle transition.
    pub fn transition(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
        next: CandidateState,
        reason: &str,
    ) -> Result<()> {
        let from = candidate.state;
        if !from.can_transition_to(next) {
            return Err(GleanerError::conflict(
                ConflictKind::IllegalTransition,
                EntityKind::Candidate,
                candidate.id,
                from,
                next,
            ));
        }
        candidate.state = next;
        candidate.updated_at = self.clock.now();
        tx.save_candidate(candidate)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Candidate, candidate.id, "candidate.state_changed")
                .with_payload(json!({ "from": from, "to": next, "reason": reason })),
        )?;
        tracing::info!(candidate_id = %candidate.id, %from, to = %next, reason, "candidate transitioned");
        Ok(())
    }

    /// Brings a candidate in line with its posting's status.
    pub fn follow_posting(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
        status: PostingStatus,
        reason: &str,
    ) -> Result<()> {
        let target = status.candidate_state();
        if candidate.state == target {
            return Ok(());
        }
        self.transition(tx, actor, candidate, target, reason)
    }

    /// Folds `secondary` into `primary`: the secondary ends `rejected` with
    /// `merged_into` set. Links and evidence are moved by the caller.
    pub fn absorb(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        secondary: &mut PostingCandidate,
        primary: CandidateId,
        reason: &str,
    ) -> Result<()> {
        if secondary.state.is_terminal() || secondary.owns_posting() {
            return Err(GleanerError::conflict(
                ConflictKind::IllegalTransition,
                EntityKind::Candidate,
                secondary.id,
                secondary.state,
                format!("merged into {primary}"),
            ));
        }
        let from = secondary.state;
        secondary.state = CandidateState::Rejected;
        secondary.merged_into = Some(primary);
        secondary.updated_at = self.clock.now();
        tx.save_candidate(secondary)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Candidate, secondary.id, "candidate.merged").with_payload(
                json!({ "from": from, "to": CandidateState::Rejected, "merged_into": primary, "reason": reason }),
            ),
        )?;
        tracing::info!(candidate_id = %secondary.id, merged_into = %primary, "candidate merged");
        Ok(())
    }

    /// Administrative override: skips the transition table, audited separately.
    pub fn override_state(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
        next: CandidateState,
        reason: &str,
    ) -> Result<()> {
        let from = candidate.state;
        candidate.state = next;
        candidate.updated_at = self.clock.now();
        tx.save_candidate(candidate)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Candidate, candidate.id, "candidate.overridden")
                .with_payload(json!({ "from": from, "to": next, "reason": reason })),
        )?;
        tracing::warn!(candidate_id = %candidate.id, %from, to = %next, %actor, "candidate state overridden");
        Ok(())
    }

    /// Saves a content change (fields, evidence, URL) without a state change.
    pub fn update_content(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        candidate.updated_at = self.clock.now();
        tx.save_candidate(candidate)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::Candidate, candidate.id, event_type).with_payload(payload),
        )?;
        Ok(())
    }
}
