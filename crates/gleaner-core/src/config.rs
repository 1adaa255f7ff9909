//! Runtime configuration.
//!
//! Loaded from `gleaner.toml` (path from `--config` or `GLEANER_CONFIG`).
//! Every section has defaults, so an empty file is a valid config.
//! A few values can be overridden from the environment; environment wins
//! over the file, which wins over defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{GleanerError, Result, TrustLevel, TrustPolicy};
use crate::ledger::RetryPolicy;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "gleaner.toml";

pub const ENV_CONFIG_PATH: &str = "GLEANER_CONFIG";
pub const ENV_MAX_ATTEMPTS: &str = "GLEANER_MAX_ATTEMPTS";
pub const ENV_LEASE_SECS: &str = "GLEANER_LEASE_SECS";
pub const ENV_WORKERS: &str = "GLEANER_WORKERS";

// ---------------------------------------------------------------------------
// Config structs (matching gleaner.toml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GleanerConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub dedupe: DedupeConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Fallback for sources without a trust policy row.
    #[serde(default)]
    pub default_policy: DefaultPolicyConfig,
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Attempt ceiling before a failed job is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lease length handed out by workers.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl LedgerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_lease_secs() -> u32 {
    30
}
fn default_backoff_base_ms() -> u64 {
    2_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_backoff_jitter_ms() -> u64 {
    1_000
}

/// `[dedupe]` section: scorer thresholds and weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupeConfig {
    /// Confidence given to the weakest strong signal.
    #[serde(default = "default_strong_threshold")]
    pub strong_threshold: f64,

    #[serde(default = "default_band_low")]
    pub uncertain_band_low: f64,

    #[serde(default = "default_band_high")]
    pub uncertain_band_high: f64,

    /// Distance from a band edge inside which tie-break signals apply.
    #[serde(default = "default_tie_break_band")]
    pub tie_break_band: f64,

    #[serde(default = "default_title_weight")]
    pub title_weight: f64,

    #[serde(default = "default_organization_weight")]
    pub organization_weight: f64,

    #[serde(default = "default_phrases_weight")]
    pub phrases_weight: f64,

    #[serde(default = "default_bonus")]
    pub entity_bonus: f64,

    #[serde(default = "default_bonus")]
    pub email_domain_bonus: f64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            strong_threshold: default_strong_threshold(),
            uncertain_band_low: default_band_low(),
            uncertain_band_high: default_band_high(),
            tie_break_band: default_tie_break_band(),
            title_weight: default_title_weight(),
            organization_weight: default_organization_weight(),
            phrases_weight: default_phrases_weight(),
            entity_bonus: default_bonus(),
            email_domain_bonus: default_bonus(),
        }
    }
}

impl DedupeConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("strong_threshold", self.strong_threshold),
            ("uncertain_band_low", self.uncertain_band_low),
            ("uncertain_band_high", self.uncertain_band_high),
            ("tie_break_band", self.tie_break_band),
            ("title_weight", self.title_weight),
            ("organization_weight", self.organization_weight),
            ("phrases_weight", self.phrases_weight),
            ("entity_bonus", self.entity_bonus),
            ("email_domain_bonus", self.email_domain_bonus),
        ];
        for (name, value) in unit {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(GleanerError::Config(format!(
                    "dedupe.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.uncertain_band_low > self.uncertain_band_high {
            return Err(GleanerError::Config(format!(
                "dedupe.uncertain_band_low ({}) exceeds uncertain_band_high ({})",
                self.uncertain_band_low, self.uncertain_band_high
            )));
        }
        if self.uncertain_band_high > self.strong_threshold {
            return Err(GleanerError::Config(
                "dedupe.uncertain_band_high must not exceed strong_threshold".into(),
            ));
        }
        if self.title_weight + self.organization_weight + self.phrases_weight <= 0.0 {
            return Err(GleanerError::Config("dedupe weights must not all be zero".into()));
        }
        Ok(())
    }
}

fn default_strong_threshold() -> f64 {
    0.95
}
fn default_band_low() -> f64 {
    0.70
}
fn default_band_high() -> f64 {
    0.95
}
fn default_tie_break_band() -> f64 {
    0.05
}
fn default_title_weight() -> f64 {
    0.5
}
fn default_organization_weight() -> f64 {
    0.3
}
fn default_phrases_weight() -> f64 {
    0.2
}
fn default_bonus() -> f64 {
    0.05
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// First sleep after an empty poll.
    #[serde(default = "default_poll_min_ms")]
    pub poll_min_ms: u64,

    /// Longest sleep between empty polls.
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,

    /// Claimable jobs fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_min_ms: default_poll_min_ms(),
            poll_max_ms: default_poll_max_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_poll_min_ms() -> u64 {
    100
}
fn default_poll_max_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    8
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_freshness_interval_secs")]
    pub freshness_interval_secs: u64,

    /// Postings unchecked for longer than this get a freshness job.
    #[serde(default = "default_freshness_max_age_secs")]
    pub freshness_max_age_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: default_reap_interval_secs(),
            freshness_interval_secs: default_freshness_interval_secs(),
            freshness_max_age_secs: default_freshness_max_age_secs(),
        }
    }
}

fn default_reap_interval_secs() -> u64 {
    5
}
fn default_freshness_interval_secs() -> u64 {
    3_600
}
fn default_freshness_max_age_secs() -> u64 {
    86_400
}

/// `[default_policy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultPolicyConfig {
    #[serde(default = "default_trust_level")]
    pub trust_level: TrustLevel,

    #[serde(default)]
    pub auto_publish: bool,

    #[serde(default = "default_true")]
    pub requires_moderation: bool,
}

impl Default for DefaultPolicyConfig {
    fn default() -> Self {
        Self {
            trust_level: default_trust_level(),
            auto_publish: false,
            requires_moderation: true,
        }
    }
}

impl DefaultPolicyConfig {
    /// The fallback policy as seen for `source_key`.
    pub fn policy_for(&self, source_key: &str) -> TrustPolicy {
        TrustPolicy {
            trust_level: self.trust_level,
            auto_publish: self.auto_publish,
            requires_moderation: self.requires_moderation,
            ..TrustPolicy::conservative_default(source_key)
        }
    }
}

fn default_trust_level() -> TrustLevel {
    TrustLevel::Untrusted
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl GleanerConfig {
    /// Parses TOML text and validates it. Environment overrides are not applied.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: GleanerConfig = toml::from_str(raw)
            .map_err(|e| GleanerError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` (defaults when it does not exist), then applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                GleanerError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            Self::from_toml_str(&raw)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `GLEANER_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_MAX_ATTEMPTS) {
            self.ledger.max_attempts = parse_env(ENV_MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(ENV_LEASE_SECS) {
            self.ledger.lease_secs = parse_env(ENV_LEASE_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKERS) {
            self.worker.workers = parse_env(ENV_WORKERS, &v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.max_attempts == 0 {
            return Err(GleanerError::Config("ledger.max_attempts must be at least 1".into()));
        }
        if self.ledger.lease_secs == 0 {
            return Err(GleanerError::Config("ledger.lease_secs must be at least 1".into()));
        }
        if !self.ledger.backoff_multiplier.is_finite() || self.ledger.backoff_multiplier < 1.0 {
            return Err(GleanerError::Config(
                "ledger.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.worker.workers == 0 {
            return Err(GleanerError::Config("worker.workers must be at least 1".into()));
        }
        if self.worker.batch_size == 0 {
            return Err(GleanerError::Config("worker.batch_size must be at least 1".into()));
        }
        if self.worker.poll_min_ms > self.worker.poll_max_ms {
            return Err(GleanerError::Config(
                "worker.poll_min_ms exceeds worker.poll_max_ms".into(),
            ));
        }
        if self.scheduler.reap_interval_secs == 0 || self.scheduler.freshness_interval_secs == 0 {
            return Err(GleanerError::Config("scheduler intervals must be positive".into()));
        }
        self.dedupe.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| GleanerError::Config(format!("{key} has an invalid value: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = GleanerConfig::from_toml_str("").unwrap();
        assert_eq!(config.ledger.max_attempts, 3);
        assert_eq!(config.ledger.lease_secs, 30);
        assert_eq!(config.dedupe, DedupeConfig::default());
        assert_eq!(config.worker.workers, 2);
        assert!(config.default_policy.requires_moderation);
    }

    #[test]
    fn sections_override_defaults() {
        let config = GleanerConfig::from_toml_str(
            r#"
            [ledger]
            max_attempts = 5

            [dedupe]
            uncertain_band_low = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(config.ledger.max_attempts, 5);
        assert_eq!(config.ledger.backoff_base_ms, 2_000);
        assert_eq!(config.dedupe.uncertain_band_low, 0.6);
    }

    #[test]
    fn inverted_band_is_rejected() {
        let err = GleanerConfig::from_toml_str(
            r#"
            [dedupe]
            uncertain_band_low = 0.9
            uncertain_band_high = 0.8
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GleanerError::Config(_)));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = GleanerConfig::from_toml_str("[ledger]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, GleanerError::Config(_)));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = GleanerConfig::default();
        config
            .apply_overrides(|key| match key {
                ENV_MAX_ATTEMPTS => Some("7".into()),
                ENV_WORKERS => Some(" 4 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.ledger.max_attempts, 7);
        assert_eq!(config.worker.workers, 4);
        assert_eq!(config.ledger.lease_secs, 30);
    }

    #[test]
    fn malformed_env_value_is_a_config_error() {
        let mut config = GleanerConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_LEASE_SECS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, GleanerError::Config(_)));
    }

    #[test]
    fn default_policy_section_builds_a_fallback() {
        let config = GleanerConfig::default();
        let policy = config.default_policy.policy_for("rss:unknown");
        assert_eq!(policy.source_key, "rss:unknown");
        assert!(!policy.publishes_without_review());
    }
}
