//! Merge Policy Router
//!
//! 処理済み candidate を、同じ dedupe bucket の未解決 candidate と比較し、
//! ソースの TrustPolicy に従って行き先を決めます。
//!
//! ラベルの優先順位:
//! 1. candidate か best match の相手に risk flag あり → `risk_flagged`
//! 2. best match の confidence >= auto_merge threshold → `strong_match`
//! 3. confidence >= review threshold → `uncertain_match`
//! 4. それ以外 → `no_match`
//!
//! risk flag の付いた candidate は自動では publish されません。
//!
//! ラベルから action への対応は `PolicyRules::action_for`（デコード済みの
//! tagged enum）で引くだけで、ここで rules を読み直すことはしません。
//!
//! MergeDecision は (primary, secondary) ペアごとに 1 行で、同じペアを
//! 再評価しても行もイベントも増えません。

use std::sync::Arc;

use serde_json::json;

use crate::dedupe::{DedupeScorer, ScoreBreakdown};
use crate::domain::{
    Actor, CandidateId, CandidateState, ConflictKind, DecisionId, EntityKind, EntityType,
    GleanerError, MergeDecision, MergeDecisionKind, NewEvent, PostingCandidate, PostingId,
    Result, RouteAction, RouteLabel, TrustPolicy,
};
use crate::lifecycle::{CandidateMachine, PostingLifecycle};
use crate::policy::TrustPolicyEngine;
use crate::ports::{Clock, IdGenerator, Tx, next_id};
use crate::provenance::ProvenanceRecorder;

/// Risk flag set when a candidate's canonical hash already belongs to
/// another candidate's posting.
pub const FLAG_CANONICAL_HASH_TAKEN: &str = "canonical_hash_taken";

/// Where routing left the candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    Merged {
        primary: CandidateId,
        secondary: CandidateId,
        decision: DecisionId,
    },
    NeedsReview {
        decision: Option<DecisionId>,
    },
    Published {
        posting: PostingId,
    },
    Rejected,
    /// Nothing to do (candidate not routable, or a re-run with no new outcome).
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    pub label: RouteLabel,
    pub action: RouteAction,
    pub confidence: Option<f64>,
    pub routing: Routing,
}

impl RouteOutcome {
    fn unchanged() -> Self {
        Self {
            label: RouteLabel::NoMatch,
            action: RouteAction::Proceed,
            confidence: None,
            routing: Routing::Unchanged,
        }
    }
}

#[derive(Clone)]
pub struct MergeRouter {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    provenance: ProvenanceRecorder,
    scorer: DedupeScorer,
    policies: TrustPolicyEngine,
    candidates: CandidateMachine,
    postings: PostingLifecycle,
}

impl MergeRouter {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        provenance: ProvenanceRecorder,
        scorer: DedupeScorer,
        policies: TrustPolicyEngine,
        candidates: CandidateMachine,
        postings: PostingLifecycle,
    ) -> Self {
        Self {
            clock,
            ids,
            provenance,
            scorer,
            policies,
            candidates,
            postings,
        }
    }

    pub fn scorer(&self) -> &DedupeScorer {
        &self.scorer
    }

    /// Routes a `processed` candidate. A `needs_review` candidate is only
    /// moved when it now qualifies for an auto-merge; anything else is `Unchanged`.
    #[tracing::instrument(skip(self, tx), fields(actor = %actor))]
    pub fn route(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate_id: CandidateId,
    ) -> Result<RouteOutcome> {
        let mut candidate = self.candidates.load(tx, candidate_id)?;
        if !matches!(
            candidate.state,
            CandidateState::Processed | CandidateState::NeedsReview
        ) {
            tracing::debug!(candidate_id = %candidate_id, state = %candidate.state, "candidate not routable");
            return Ok(RouteOutcome::unchanged());
        }

        let policy = self.policies.resolve(tx, &candidate.source_key)?;
        let peers: Vec<PostingCandidate> = tx
            .candidates_in_bucket(&candidate.dedupe_bucket_key)?
            .into_iter()
            .filter(|p| p.id != candidate.id && !p.state.is_terminal())
            .collect();
        let best = self
            .scorer
            .best_match(&candidate, &peers)
            .map(|(peer, breakdown)| (peer.clone(), breakdown));
        let confidence = best.as_ref().map(|(_, b)| b.confidence);

        let thresholds = policy.rules.thresholds;
        let flagged = !candidate.risk_flags.is_empty()
            || best.as_ref().is_some_and(|(peer, _)| !peer.risk_flags.is_empty());
        let label = match confidence {
            _ if flagged => RouteLabel::RiskFlagged,
            Some(c) if c >= thresholds.auto_merge => RouteLabel::StrongMatch,
            Some(c) => thresholds.label_for(c),
            None => RouteLabel::NoMatch,
        };
        let action = policy.rules.action_for(label);
        tracing::info!(candidate_id = %candidate_id, %label, ?action, ?confidence, "candidate routed");

        let reviewing = candidate.state == CandidateState::NeedsReview;
        if reviewing && action != RouteAction::AutoMerge {
            return Ok(RouteOutcome {
                label,
                action,
                confidence,
                routing: Routing::Unchanged,
            });
        }
        candidate.dedupe_confidence = confidence;

        let routing = match (action, best) {
            (RouteAction::AutoMerge, Some((mut peer, breakdown))) => {
                self.auto_merge(tx, actor, &mut candidate, &mut peer, &breakdown)?
            }
            (RouteAction::Review, best) => {
                let credible = best.filter(|(_, b)| b.confidence >= thresholds.review);
                let decision = match credible {
                    Some((peer, breakdown)) => {
                        Some(self.record_review(tx, actor, &candidate, &peer, &breakdown)?)
                    }
                    None => None,
                };
                let reason = format!("routed by {label}");
                self.candidates.transition(
                    tx,
                    actor,
                    &mut candidate,
                    CandidateState::NeedsReview,
                    &reason,
                )?;
                Routing::NeedsReview { decision }
            }
            (RouteAction::Reject, _) => {
                let reason = format!("rejected by policy route {label}");
                self.candidates.transition(
                    tx,
                    actor,
                    &mut candidate,
                    CandidateState::Rejected,
                    &reason,
                )?;
                Routing::Rejected
            }
            (RouteAction::Proceed, _) | (RouteAction::AutoMerge, None) => {
                self.publish_or_review(tx, actor, &mut candidate, &policy)?
            }
        };

        Ok(RouteOutcome {
            label,
            action,
            confidence,
            routing,
        })
    }

    /// Publishes a `processed` candidate when its source may skip review and
    /// it carries no risk flags, otherwise parks it in `needs_review`.
    pub fn publish_or_review(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
        policy: &TrustPolicy,
    ) -> Result<Routing> {
        let hold = if !policy.publishes_without_review() {
            Some("source requires moderation")
        } else if !candidate.risk_flags.is_empty() {
            Some("risk flags present")
        } else {
            None
        };
        if let Some(reason) = hold {
            self.candidates.transition(
                tx,
                actor,
                candidate,
                CandidateState::NeedsReview,
                reason,
            )?;
            return Ok(Routing::NeedsReview { decision: None });
        }

        if let Some(owner) = self.postings.hash_owner(tx, candidate)? {
            tracing::warn!(candidate_id = %candidate.id, posting_id = %owner.id, "canonical hash already published");
            candidate.add_risk_flags([&FLAG_CANONICAL_HASH_TAKEN.to_string()]);
            self.candidates.transition(
                tx,
                actor,
                candidate,
                CandidateState::NeedsReview,
                "canonical hash already published",
            )?;
            return Ok(Routing::NeedsReview { decision: None });
        }

        self.candidates.transition(
            tx,
            actor,
            candidate,
            CandidateState::Publishable,
            "auto-publish",
        )?;
        let posting = self.postings.publish(tx, actor, candidate)?;
        Ok(Routing::Published {
            posting: posting.id,
        })
    }

    fn auto_merge(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &mut PostingCandidate,
        peer: &mut PostingCandidate,
        breakdown: &ScoreBreakdown,
    ) -> Result<Routing> {
        let candidate_is_primary = is_primary(candidate, peer);
        let (primary, secondary) = if candidate_is_primary {
            (candidate, peer)
        } else {
            (peer, candidate)
        };
        let decision = self.merge(
            tx,
            actor,
            primary,
            secondary,
            MergeDecisionKind::AutoMerged,
            breakdown.confidence,
            &rationale(breakdown),
        )?;

        if primary.state == CandidateState::Processed {
            let policy = self.policies.resolve(tx, &primary.source_key)?;
            self.publish_or_review(tx, actor, primary, &policy)?;
        }
        Ok(Routing::Merged {
            primary: primary.id,
            secondary: secondary.id,
            decision: decision.id,
        })
    }

    /// Records a merge and folds `secondary` into `primary`.
    ///
    /// Re-merging a pair that is already merged returns the stored decision
    /// without writing anything.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        primary: &mut PostingCandidate,
        secondary: &mut PostingCandidate,
        kind: MergeDecisionKind,
        confidence: f64,
        rationale: &str,
    ) -> Result<MergeDecision> {
        if primary.id == secondary.id {
            return Err(GleanerError::validation("cannot merge a candidate into itself"));
        }
        if let Some(existing) = tx.merge_decision_for_pair(primary.id, secondary.id)? {
            if existing.decision.is_merge() {
                return Ok(existing);
            }
        }
        if primary.owns_posting() && secondary.owns_posting() {
            return Err(GleanerError::conflict(
                ConflictKind::MergeOfPostedCandidates,
                EntityKind::Candidate,
                secondary.id,
                format!("both {} and {} own a posting", primary.id, secondary.id),
                kind,
            ));
        }
        if secondary.owns_posting() || secondary.state.is_terminal() {
            return Err(GleanerError::conflict(
                ConflictKind::IllegalTransition,
                EntityKind::Candidate,
                secondary.id,
                secondary.state,
                format!("merged into {}", primary.id),
            ));
        }
        if primary.state.is_terminal() {
            return Err(GleanerError::conflict(
                ConflictKind::IllegalTransition,
                EntityKind::Candidate,
                primary.id,
                primary.state,
                format!("absorb {}", secondary.id),
            ));
        }

        let decision =
            self.record_decision(tx, actor, primary.id, secondary.id, kind, confidence, rationale)?;

        for discovery in tx.discoveries_for_candidate(secondary.id)? {
            tx.link_discovery(primary.id, discovery)?;
        }
        primary.evidence.union(&secondary.evidence);
        primary
            .extracted_fields
            .fill_missing_from(&secondary.extracted_fields);
        primary.add_risk_flags(&secondary.risk_flags);
        self.candidates.update_content(
            tx,
            actor,
            primary,
            "candidate.evidence_merged",
            json!({
                "from": secondary.id,
                "decision_id": decision.id,
                "risk_flags": secondary.risk_flags,
            }),
        )?;
        self.postings.refresh_content(tx, actor, primary)?;
        self.candidates
            .absorb(tx, actor, secondary, primary.id, &format!("{kind}"))?;
        Ok(decision)
    }

    /// Marks open review decisions on `candidate` as `rejected` (not duplicates).
    pub fn dismiss_reviews(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: CandidateId,
        reason: &str,
    ) -> Result<usize> {
        let mut dismissed = 0;
        for mut decision in tx.merge_decisions_for(candidate)? {
            if decision.decision != MergeDecisionKind::NeedsReview {
                continue;
            }
            self.resolve(tx, actor, &mut decision, MergeDecisionKind::Rejected, None, reason)?;
            dismissed += 1;
        }
        Ok(dismissed)
    }

    fn record_review(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        candidate: &PostingCandidate,
        peer: &PostingCandidate,
        breakdown: &ScoreBreakdown,
    ) -> Result<DecisionId> {
        let (primary, secondary) = if is_primary(candidate, peer) {
            (candidate.id, peer.id)
        } else {
            (peer.id, candidate.id)
        };
        if let Some(existing) = tx.merge_decision_for_pair(primary, secondary)? {
            return Ok(existing.id);
        }
        let decision = self.insert_decision(
            tx,
            actor,
            primary,
            secondary,
            MergeDecisionKind::NeedsReview,
            breakdown.confidence,
            &rationale(breakdown),
        )?;
        Ok(decision.id)
    }

    /// Inserts a decision, or upgrades an open `needs_review` one.
    #[allow(clippy::too_many_arguments)]
    fn record_decision(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        primary: CandidateId,
        secondary: CandidateId,
        kind: MergeDecisionKind,
        confidence: f64,
        rationale: &str,
    ) -> Result<MergeDecision> {
        match tx.merge_decision_for_pair(primary, secondary)? {
            None => self.insert_decision(tx, actor, primary, secondary, kind, confidence, rationale),
            Some(mut open) if open.decision == MergeDecisionKind::NeedsReview => {
                open.primary_candidate_id = primary;
                open.secondary_candidate_id = secondary;
                self.resolve(tx, actor, &mut open, kind, Some(confidence), rationale)?;
                Ok(open)
            }
            Some(existing) if existing.decision == kind => Ok(existing),
            Some(existing) => Err(GleanerError::conflict(
                ConflictKind::DuplicateDecision,
                EntityKind::MergeDecision,
                existing.id,
                existing.decision,
                kind,
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_decision(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        primary: CandidateId,
        secondary: CandidateId,
        kind: MergeDecisionKind,
        confidence: f64,
        rationale: &str,
    ) -> Result<MergeDecision> {
        let now = self.clock.now();
        let decision = MergeDecision {
            id: next_id(self.ids.as_ref()),
            primary_candidate_id: primary,
            secondary_candidate_id: secondary,
            decision: kind,
            confidence,
            decided_by: actor.to_string(),
            rationale: rationale.to_string(),
            created_at: now,
            updated_at: now,
        };
        tx.insert_merge_decision(&decision)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::MergeDecision, decision.id, "merge_decision.recorded")
                .with_payload(json!({
                    "primary_candidate_id": primary,
                    "secondary_candidate_id": secondary,
                    "decision": kind,
                    "confidence": confidence,
                })),
        )?;
        tracing::info!(decision_id = %decision.id, %primary, %secondary, decision = %kind, confidence, "merge decision recorded");
        Ok(decision)
    }

    fn resolve(
        &self,
        tx: &mut dyn Tx,
        actor: &Actor,
        decision: &mut MergeDecision,
        kind: MergeDecisionKind,
        confidence: Option<f64>,
        rationale: &str,
    ) -> Result<()> {
        let from = decision.decision;
        decision.decision = kind;
        if let Some(c) = confidence {
            decision.confidence = c;
        }
        decision.decided_by = actor.to_string();
        decision.rationale = rationale.to_string();
        decision.updated_at = self.clock.now();
        tx.save_merge_decision(decision)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::MergeDecision, decision.id, "merge_decision.resolved")
                .with_payload(json!({ "from": from, "to": kind, "reason": rationale })),
        )?;
        Ok(())
    }
}

/// Posting owner first, then the older candidate (ULID order breaks ties).
fn is_primary(a: &PostingCandidate, b: &PostingCandidate) -> bool {
    match (a.owns_posting(), b.owns_posting()) {
        (true, false) => true,
        (false, true) => false,
        _ => (a.created_at, a.id) < (b.created_at, b.id),
    }
}

fn rationale(breakdown: &ScoreBreakdown) -> String {
    serde_json::to_string(breakdown).unwrap_or_else(|_| format!("confidence={}", breakdown.confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::{Signal, SignalTier};
    use chrono::{Duration, TimeZone, Utc};
    use ulid::Ulid;

    fn candidate(minutes: i64) -> PostingCandidate {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);
        PostingCandidate::new(
            CandidateId::from_ulid(Ulid::new()),
            "rss:x",
            "https://x.org/a",
            "x.org",
            at,
        )
    }

    #[test]
    fn posting_owner_is_primary_regardless_of_age() {
        let older = candidate(0);
        let mut newer = candidate(5);
        newer.posting_id = Some(PostingId::from_ulid(Ulid::new()));
        assert!(is_primary(&newer, &older));
        assert!(!is_primary(&older, &newer));
    }

    #[test]
    fn older_candidate_is_primary_without_postings() {
        let older = candidate(0);
        let newer = candidate(5);
        assert!(is_primary(&older, &newer));
        assert!(!is_primary(&newer, &older));
    }

    #[test]
    fn rationale_is_the_score_breakdown() {
        let breakdown = ScoreBreakdown {
            confidence: 1.0,
            tier: SignalTier::Strong,
            signals: vec![Signal {
                name: "content_hash",
                value: 1.0,
            }],
            tie_break_applied: false,
        };
        let parsed: serde_json::Value = serde_json::from_str(&rationale(&breakdown)).unwrap();
        assert_eq!(parsed["tier"], "strong");
        assert_eq!(parsed["signals"][0]["name"], "content_hash");
    }
}
