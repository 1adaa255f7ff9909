//! Provenance Recorder - append-only な監査ログ
//!
//! すべての状態遷移はここを通って 1 行の `ProvenanceEvent` を残します。
//! 書き込みは呼び出し側の `Tx` に乗るので、遷移とイベントは同じ
//! トランザクションで commit / rollback されます。

use std::sync::Arc;

use crate::domain::{Actor, EntityType, NewEvent, ProvenanceEvent, Result};
use crate::ports::{Clock, IdGenerator, Tx, next_id};

#[derive(Clone)]
pub struct ProvenanceRecorder {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl ProvenanceRecorder {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { clock, ids }
    }

    pub fn record(&self, tx: &mut dyn Tx, actor: &Actor, event: NewEvent) -> Result<ProvenanceEvent> {
        let stored = ProvenanceEvent {
            id: next_id(self.ids.as_ref()),
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            event_type: event.event_type,
            actor: actor.to_string(),
            payload: event.payload,
            created_at: self.clock.now(),
        };
        tx.append_event(&stored)?;
        tracing::trace!(
            entity_type = %stored.entity_type,
            entity_id = %stored.entity_id,
            event_type = %stored.event_type,
            "provenance recorded"
        );
        Ok(stored)
    }

    pub fn history(
        &self,
        tx: &dyn Tx,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<ProvenanceEvent>> {
        tx.events_for(entity_type, entity_id)
    }
}
