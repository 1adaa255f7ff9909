//! Discovery - 取り込み済みの生レコード（append-only）
//!
//! Discovery は ingest 側が所有します。core は読むだけで、更新・削除はしません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::DiscoveryId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub id: DiscoveryId,
    /// Trust policy key of the connector / submitter.
    pub source_key: String,
    pub normalized_url: String,
    pub canonical_hash: String,
    /// Raw connector payload, opaque to the core.
    #[serde(default)]
    pub raw: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Discovery {
    pub fn new(
        id: DiscoveryId,
        source_key: impl Into<String>,
        normalized_url: impl Into<String>,
        canonical_hash: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_key: source_key.into(),
            normalized_url: normalized_url.into(),
            canonical_hash: canonical_hash.into(),
            raw: serde_json::Value::Null,
            received_at,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}
