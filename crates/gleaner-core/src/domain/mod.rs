//! Domain model (IDs, records, state enums, policies, errors).
//!
//! ここには副作用を持たない型だけを置きます。状態遷移のガードと
//! provenance 書き込みは ledger / lifecycle / router が担当します。

pub mod actor;
pub mod candidate;
pub mod discovery;
pub mod errors;
pub mod ids;
pub mod job;
pub mod merge;
pub mod payloads;
pub mod policy;
pub mod posting;
pub mod provenance;

pub use actor::{Actor, Capability};
pub use candidate::{CandidateState, Entities, Evidence, ExtractedFields, PostingCandidate};
pub use discovery::Discovery;
pub use errors::{ConflictKind, EntityKind, GleanerError, Result};
pub use ids::{CandidateId, DecisionId, DiscoveryId, EventId, JobId, PostingId};
pub use job::{Job, JobCounts, JobFilter, JobKind, JobOutcome, JobStatus, NewJob, TargetType};
pub use merge::{MergeDecision, MergeDecisionKind};
pub use payloads::{
    DedupeInput, DedupeResult, EnrichInput, EnrichResult, ExtractInput, ExtractResult,
    FreshnessInput, FreshnessResult, JobResult, RedirectInput, RedirectResult,
};
pub use policy::{PolicyRules, PolicyThresholds, RouteAction, RouteLabel, TrustLevel, TrustPolicy};
pub use posting::{Posting, PostingStatus};
pub use provenance::{EntityType, NewEvent, ProvenanceEvent};
