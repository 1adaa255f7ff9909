//! TrustPolicy - ソースごとの公開ポリシー
//!
//! `rules` は JSON blob のまま router に渡さず、境界で一度だけ
//! tagged enum（`RouteLabel` → `RouteAction`）にデコード・検証します。
//! 未知のキー・未知の action・形式不正な route label はデコード時点で拒否します。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::{GleanerError, Result};

static ROUTE_LABEL_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{1,47}$").expect("route label pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    SemiTrusted,
    Untrusted,
}

/// Situations the merge router distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RouteLabel {
    StrongMatch,
    UncertainMatch,
    NoMatch,
    RiskFlagged,
}

impl RouteLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteLabel::StrongMatch => "strong_match",
            RouteLabel::UncertainMatch => "uncertain_match",
            RouteLabel::NoMatch => "no_match",
            RouteLabel::RiskFlagged => "risk_flagged",
        }
    }

    /// Action used when a policy does not configure the label.
    pub fn default_action(self) -> RouteAction {
        match self {
            RouteLabel::StrongMatch => RouteAction::AutoMerge,
            RouteLabel::UncertainMatch => RouteAction::Review,
            RouteLabel::NoMatch => RouteAction::Proceed,
            RouteLabel::RiskFlagged => RouteAction::Review,
        }
    }
}

impl TryFrom<String> for RouteLabel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if !ROUTE_LABEL_FORMAT.is_match(&value) {
            return Err(format!("malformed route label: {value:?}"));
        }
        match value.as_str() {
            "strong_match" => Ok(RouteLabel::StrongMatch),
            "uncertain_match" => Ok(RouteLabel::UncertainMatch),
            "no_match" => Ok(RouteLabel::NoMatch),
            "risk_flagged" => Ok(RouteLabel::RiskFlagged),
            other => Err(format!("unknown route label: {other}")),
        }
    }
}

impl From<RouteLabel> for String {
    fn from(label: RouteLabel) -> Self {
        label.as_str().to_string()
    }
}

impl fmt::Display for RouteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the router does for a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    /// Merge into the best match.
    AutoMerge,
    /// Park in `needs_review`.
    Review,
    /// Treat as independent; publication follows trust settings.
    Proceed,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyThresholds {
    /// Scores at or above this are strong matches.
    #[serde(default = "default_auto_merge")]
    pub auto_merge: f64,
    /// Lower edge of the uncertain band.
    #[serde(default = "default_review")]
    pub review: f64,
}

fn default_auto_merge() -> f64 {
    0.95
}
fn default_review() -> f64 {
    0.70
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            auto_merge: default_auto_merge(),
            review: default_review(),
        }
    }
}

impl PolicyThresholds {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(self.auto_merge) || !in_unit(self.review) {
            return Err(GleanerError::validation(format!(
                "thresholds must be within [0, 1]: auto_merge={}, review={}",
                self.auto_merge, self.review
            )));
        }
        if self.review > self.auto_merge {
            return Err(GleanerError::validation(format!(
                "review threshold {} exceeds auto_merge threshold {}",
                self.review, self.auto_merge
            )));
        }
        Ok(())
    }

    pub fn label_for(&self, confidence: f64) -> RouteLabel {
        if confidence >= self.auto_merge {
            RouteLabel::StrongMatch
        } else if confidence >= self.review {
            RouteLabel::UncertainMatch
        } else {
            RouteLabel::NoMatch
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRules {
    #[serde(default)]
    pub thresholds: PolicyThresholds,
    #[serde(default)]
    pub routes: BTreeMap<RouteLabel, RouteAction>,
}

impl PolicyRules {
    pub fn action_for(&self, label: RouteLabel) -> RouteAction {
        self.routes
            .get(&label)
            .copied()
            .unwrap_or_else(|| label.default_action())
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        for (label, action) in &self.routes {
            let merge_allowed = matches!(label, RouteLabel::StrongMatch | RouteLabel::UncertainMatch);
            if *action == RouteAction::AutoMerge && !merge_allowed {
                return Err(GleanerError::validation(format!(
                    "route {label} cannot auto_merge: there is no match to merge into"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustPolicy {
    pub source_key: String,
    pub trust_level: TrustLevel,
    pub auto_publish: bool,
    pub requires_moderation: bool,
    #[serde(default)]
    pub rules: PolicyRules,
}

impl TrustPolicy {
    /// Fallback for sources without a policy row.
    pub fn conservative_default(source_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            trust_level: TrustLevel::Untrusted,
            auto_publish: false,
            requires_moderation: true,
            rules: PolicyRules::default(),
        }
    }

    pub fn trusted(source_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            trust_level: TrustLevel::Trusted,
            auto_publish: true,
            requires_moderation: false,
            rules: PolicyRules::default(),
        }
    }

    /// Whether a candidate with no credible match may go straight to publication.
    pub fn publishes_without_review(&self) -> bool {
        self.auto_publish && !self.requires_moderation
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_key.trim().is_empty() {
            return Err(GleanerError::validation("source_key must not be empty"));
        }
        self.rules.validate()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let policy: TrustPolicy = serde_json::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let policy: TrustPolicy =
            toml::from_str(raw).map_err(|e| GleanerError::validation(format!("toml decode: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_conservative() {
        let p = TrustPolicy::conservative_default("rss:unknown");
        assert_eq!(p.trust_level, TrustLevel::Untrusted);
        assert!(p.requires_moderation);
        assert!(!p.publishes_without_review());
    }

    #[test]
    fn decodes_routes_into_tagged_variants() {
        let p = TrustPolicy::from_json(
            r#"{
                "source_key": "webhook:food-shelf",
                "trust_level": "semi_trusted",
                "auto_publish": true,
                "requires_moderation": false,
                "rules": {
                    "thresholds": {"auto_merge": 0.9, "review": 0.6},
                    "routes": {"uncertain_match": "auto_merge", "risk_flagged": "reject"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(p.rules.action_for(RouteLabel::UncertainMatch), RouteAction::AutoMerge);
        assert_eq!(p.rules.action_for(RouteLabel::RiskFlagged), RouteAction::Reject);
        assert_eq!(p.rules.action_for(RouteLabel::NoMatch), RouteAction::Proceed);
        assert_eq!(p.rules.thresholds.label_for(0.92), RouteLabel::StrongMatch);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = TrustPolicy::from_json(
            r#"{"source_key":"s","trust_level":"trusted","auto_publish":true,
                "requires_moderation":false,"vip":true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, GleanerError::Validation(_)));
    }

    #[test]
    fn rejects_unknown_action() {
        let err = TrustPolicy::from_json(
            r#"{"source_key":"s","trust_level":"trusted","auto_publish":true,
                "requires_moderation":false,"rules":{"routes":{"no_match":"publish_now"}}}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_malformed_and_unknown_route_labels() {
        for label in ["Strong-Match", "x", "nearly_match"] {
            let raw = format!(
                r#"{{"source_key":"s","trust_level":"trusted","auto_publish":true,
                    "requires_moderation":false,"rules":{{"routes":{{"{label}":"review"}}}}}}"#
            );
            assert!(TrustPolicy::from_json(&raw).is_err(), "label {label} accepted");
        }
    }

    #[test]
    fn rejects_auto_merge_without_a_match() {
        let mut p = TrustPolicy::trusted("s");
        p.rules.routes.insert(RouteLabel::NoMatch, RouteAction::AutoMerge);
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut p = TrustPolicy::trusted("s");
        p.rules.thresholds = PolicyThresholds {
            auto_merge: 0.6,
            review: 0.8,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn decodes_from_toml() {
        let p = TrustPolicy::from_toml(
            r#"
            source_key = "rss:city-volunteers"
            trust_level = "trusted"
            auto_publish = true
            requires_moderation = false

            [rules.routes]
            strong_match = "auto_merge"
            "#,
        )
        .unwrap();
        assert!(p.publishes_without_review());
    }
}
