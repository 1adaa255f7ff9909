//! Posting - 公開レコード

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::candidate::{CandidateState, ExtractedFields};
use super::ids::{CandidateId, PostingId};

/// Posting lifecycle: `Active <-> Stale -> Archived`, `Active|Stale -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    Active,
    Stale,
    Archived,
    Closed,
}

impl PostingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PostingStatus::Archived | PostingStatus::Closed)
    }

    pub fn can_transition_to(self, next: PostingStatus) -> bool {
        use PostingStatus::*;
        matches!(
            (self, next),
            (Active, Stale) | (Stale, Active) | (Stale, Archived) | (Active, Closed) | (Stale, Closed)
        )
    }

    /// Candidate state that mirrors this posting status.
    pub fn candidate_state(self) -> CandidateState {
        match self {
            PostingStatus::Active | PostingStatus::Stale => CandidateState::Published,
            PostingStatus::Archived => CandidateState::Archived,
            PostingStatus::Closed => CandidateState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostingStatus::Active => "active",
            PostingStatus::Stale => "stale",
            PostingStatus::Archived => "archived",
            PostingStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: PostingId,
    pub candidate_id: CandidateId,
    pub canonical_hash: String,
    pub status: PostingStatus,
    pub url: String,
    pub fields: ExtractedFields,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Liveness failures since the last success.
    pub freshness_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Posting {
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn due_for_freshness(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_live() && self.last_checked_at.is_none_or(|at| at < cutoff)
    }
}
