//! MergeDecision - 候補ペアに対する merge 判定の記録
//!
//! (primary, secondary) ごとに高々 1 行。再評価しても行は増えない。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CandidateId, DecisionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecisionKind {
    AutoMerged,
    ManualMerged,
    Rejected,
    NeedsReview,
}

impl MergeDecisionKind {
    /// `NeedsReview` may still be resolved; the rest are final.
    pub fn is_final(self) -> bool {
        !matches!(self, MergeDecisionKind::NeedsReview)
    }

    pub fn is_merge(self) -> bool {
        matches!(self, MergeDecisionKind::AutoMerged | MergeDecisionKind::ManualMerged)
    }
}

impl fmt::Display for MergeDecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeDecisionKind::AutoMerged => "auto_merged",
            MergeDecisionKind::ManualMerged => "manual_merged",
            MergeDecisionKind::Rejected => "rejected",
            MergeDecisionKind::NeedsReview => "needs_review",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub id: DecisionId,
    pub primary_candidate_id: CandidateId,
    pub secondary_candidate_id: CandidateId,
    pub decision: MergeDecisionKind,
    pub confidence: f64,
    pub decided_by: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeDecision {
    pub fn involves(&self, a: CandidateId, b: CandidateId) -> bool {
        (self.primary_candidate_id == a && self.secondary_candidate_id == b)
            || (self.primary_candidate_id == b && self.secondary_candidate_id == a)
    }
}
