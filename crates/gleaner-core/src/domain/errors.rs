//! Errors - エラー型と分類
//!
//! - Conflict: 競合（claim 負け、不正な状態遷移、posted 同士の merge など）。呼び出し側へ即返す
//! - Validation: 入力不正。状態変更の前に弾く
//! - Fatal: 不変条件違反。自動リトライしない
//! - Storage: バックエンド障害（lock poisoning など）。唯一リトライ可能
//!
//! Transient な job 失敗はエラーではなく ledger の `failed` 結果として扱う。

use std::fmt;

use thiserror::Error;

use super::actor::Capability;

/// Which entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Job,
    Discovery,
    Candidate,
    Posting,
    MergeDecision,
    TrustPolicy,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Job => "job",
            EntityKind::Discovery => "discovery",
            EntityKind::Candidate => "candidate",
            EntityKind::Posting => "posting",
            EntityKind::MergeDecision => "merge_decision",
            EntityKind::TrustPolicy => "trust_policy",
        };
        f.write_str(s)
    }
}

/// The reason a write was rejected as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another claimer won the conditional update.
    ClaimLost,
    /// The job is not `queued` or not yet due.
    NotClaimable,
    /// The caller does not hold the claim it is reporting on.
    NotLeaseHolder,
    /// The state machine has no edge for the attempted transition.
    IllegalTransition,
    /// Both candidates already own a posting.
    MergeOfPostedCandidates,
    /// A different final decision is already recorded for the pair.
    DuplicateDecision,
    /// Another candidate's posting already uses the canonical hash.
    CanonicalHashTaken,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::ClaimLost => "claim lost",
            ConflictKind::NotClaimable => "not claimable",
            ConflictKind::NotLeaseHolder => "not lease holder",
            ConflictKind::IllegalTransition => "illegal transition",
            ConflictKind::MergeOfPostedCandidates => "merge of posted candidates",
            ConflictKind::DuplicateDecision => "duplicate decision",
            ConflictKind::CanonicalHashTaken => "canonical hash taken",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum GleanerError {
    #[error("conflict ({kind}) on {entity} {id}: current={current}, attempted={attempted}")]
    Conflict {
        kind: ConflictKind,
        entity: EntityKind,
        id: String,
        current: String,
        attempted: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("actor {actor} lacks capability {capability:?}")]
    Forbidden { actor: String, capability: Capability },

    #[error("invariant violated: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GleanerError>;

impl GleanerError {
    pub fn conflict(
        kind: ConflictKind,
        entity: EntityKind,
        id: impl fmt::Display,
        current: impl fmt::Display,
        attempted: impl fmt::Display,
    ) -> Self {
        Self::Conflict {
            kind,
            entity,
            id: id.to_string(),
            current: current.to_string(),
            attempted: attempted.to_string(),
        }
    }

    pub fn not_found(entity: EntityKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, GleanerError::Conflict { .. })
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            GleanerError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Only backend failures are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GleanerError::Storage(_))
    }
}

impl From<serde_json::Error> for GleanerError {
    fn from(e: serde_json::Error) -> Self {
        GleanerError::Validation(format!("json decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_carries_transition_context() {
        let err = GleanerError::conflict(
            ConflictKind::IllegalTransition,
            EntityKind::Posting,
            "post-1",
            "archived",
            "active",
        );
        let msg = err.to_string();
        assert!(msg.contains("illegal transition"));
        assert!(msg.contains("post-1"));
        assert!(msg.contains("current=archived"));
        assert!(msg.contains("attempted=active"));
        assert_eq!(err.conflict_kind(), Some(ConflictKind::IllegalTransition));
    }

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(GleanerError::Storage("poisoned".into()).is_retryable());
        assert!(!GleanerError::Fatal("dup hash".into()).is_retryable());
        assert!(!GleanerError::validation("bad").is_retryable());
    }
}
