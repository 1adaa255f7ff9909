//! ProvenanceEvent - 監査ログの 1 行（不変）

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Candidate,
    Posting,
    MergeDecision,
    TrustPolicy,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Job => "job",
            EntityType::Candidate => "candidate",
            EntityType::Posting => "posting",
            EntityType::MergeDecision => "merge_decision",
            EntityType::TrustPolicy => "trust_policy",
        };
        f.write_str(s)
    }
}

/// An event as stored. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub id: EventId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub event_type: String,
    pub actor: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event to be appended. The recorder assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl fmt::Display,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            event_type: event_type.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
