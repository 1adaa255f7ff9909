//! Trust Policy Engine - ソースごとの公開ポリシーの解決
//!
//! `resolve` は読むだけで状態を変えません。ポリシー行がないソースは
//! `[default_policy]`（既定は untrusted + requires_moderation）にフォールバックします。

use std::sync::Arc;

use serde_json::json;

use crate::config::DefaultPolicyConfig;
use crate::domain::{Actor, EntityType, NewEvent, Result, TrustPolicy};
use crate::ports::Tx;
use crate::provenance::ProvenanceRecorder;

#[derive(Clone)]
pub struct TrustPolicyEngine {
    fallback: Arc<DefaultPolicyConfig>,
    provenance: ProvenanceRecorder,
}

impl TrustPolicyEngine {
    pub fn new(fallback: DefaultPolicyConfig, provenance: ProvenanceRecorder) -> Self {
        Self {
            fallback: Arc::new(fallback),
            provenance,
        }
    }

    pub fn resolve(&self, tx: &dyn Tx, source_key: &str) -> Result<TrustPolicy> {
        match tx.trust_policy(source_key)? {
            Some(policy) => Ok(policy),
            None => {
                tracing::debug!(source_key, "no trust policy row, using fallback");
                Ok(self.fallback.policy_for(source_key))
            }
        }
    }

    /// Validates and stores a policy. The stored row is authoritative from then on.
    pub fn put(&self, tx: &mut dyn Tx, actor: &Actor, policy: &TrustPolicy) -> Result<()> {
        policy.validate()?;
        tx.put_trust_policy(policy)?;
        self.provenance.record(
            tx,
            actor,
            NewEvent::new(EntityType::TrustPolicy, &policy.source_key, "trust_policy.updated")
                .with_payload(json!({
                    "trust_level": policy.trust_level,
                    "auto_publish": policy.auto_publish,
                    "requires_moderation": policy.requires_moderation,
                    "rules": policy.rules,
                })),
        )?;
        tracing::info!(source_key = %policy.source_key, "trust policy updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GleanerError, TrustLevel};
    use crate::impls::InMemoryStore;
    use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator, in_transaction};

    fn engine() -> TrustPolicyEngine {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        TrustPolicyEngine::new(
            DefaultPolicyConfig::default(),
            ProvenanceRecorder::new(clock, ids),
        )
    }

    #[test]
    fn unknown_source_falls_back_to_conservative_policy() {
        let store = InMemoryStore::new();
        let policy = in_transaction(&store, |tx| engine().resolve(tx, "rss:nobody")).unwrap();
        assert_eq!(policy.trust_level, TrustLevel::Untrusted);
        assert!(policy.requires_moderation);
        assert!(!policy.auto_publish);
    }

    #[test]
    fn stored_policy_wins_over_fallback() {
        let store = InMemoryStore::new();
        let engine = engine();
        in_transaction(&store, |tx| {
            engine.put(tx, &Actor::admin("a"), &TrustPolicy::trusted("rss:city"))
        })
        .unwrap();
        let policy = in_transaction(&store, |tx| engine.resolve(tx, "rss:city")).unwrap();
        assert!(policy.publishes_without_review());
    }

    #[test]
    fn invalid_policy_is_not_stored() {
        let store = InMemoryStore::new();
        let engine = engine();
        let mut bad = TrustPolicy::trusted("rss:city");
        bad.rules.thresholds.review = 2.0;
        let err = in_transaction(&store, |tx| engine.put(tx, &Actor::admin("a"), &bad)).unwrap_err();
        assert!(matches!(err, GleanerError::Validation(_)));
        let policy = in_transaction(&store, |tx| engine.resolve(tx, "rss:city")).unwrap();
        assert_eq!(policy.trust_level, TrustLevel::Untrusted);
    }
}
