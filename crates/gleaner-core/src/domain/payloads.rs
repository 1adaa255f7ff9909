//! Typed job inputs and result payloads.
//!
//! Results are decoded and validated before the ledger touches any row, so a
//! malformed payload is rejected without side effects.

use serde::{Deserialize, Serialize};
use url::Url;

use super::candidate::ExtractedFields;
use super::errors::{GleanerError, Result};
use super::ids::{CandidateId, DiscoveryId, PostingId};
use super::job::JobKind;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractInput {
    pub discovery_id: DiscoveryId,
    pub source_key: String,
    pub normalized_url: String,
    pub canonical_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreshnessInput {
    pub posting_id: PostingId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichInput {
    pub candidate_id: CandidateId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectInput {
    pub candidate_id: CandidateId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupeInput {
    pub candidate_id: CandidateId,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractResult {
    pub fields: ExtractedFields,
    #[serde(default)]
    pub risk_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreshnessResult {
    pub alive: bool,
    #[serde(default)]
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichResult {
    #[serde(default)]
    pub fields: ExtractedFields,
    #[serde(default)]
    pub risk_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectResult {
    pub resolved_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupeResult {}

/// A `done` payload decoded for its job kind.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Extract(ExtractResult),
    CheckFreshness(FreshnessResult),
    Enrich(EnrichResult),
    ResolveUrlRedirects(RedirectResult),
    Dedupe(DedupeResult),
}

impl JobResult {
    pub fn decode(kind: JobKind, raw: &serde_json::Value) -> Result<Self> {
        let decoded = match kind {
            JobKind::Extract => JobResult::Extract(serde_json::from_value(raw.clone())?),
            JobKind::CheckFreshness => JobResult::CheckFreshness(serde_json::from_value(raw.clone())?),
            JobKind::Enrich => JobResult::Enrich(decode_or_default(raw)?),
            JobKind::ResolveUrlRedirects => {
                JobResult::ResolveUrlRedirects(serde_json::from_value(raw.clone())?)
            }
            JobKind::Dedupe => JobResult::Dedupe(decode_or_default(raw)?),
        };
        decoded.validate()?;
        Ok(decoded)
    }

    fn validate(&self) -> Result<()> {
        match self {
            JobResult::Extract(r) => {
                let has_title = r
                    .fields
                    .title
                    .as_deref()
                    .is_some_and(|t| !t.trim().is_empty());
                if !has_title {
                    return Err(GleanerError::validation("extract result has no title"));
                }
                validate_optional_url("application_url", r.fields.application_url.as_deref())?;
                validate_flags(&r.risk_flags)
            }
            JobResult::Enrich(r) => {
                validate_optional_url("application_url", r.fields.application_url.as_deref())?;
                validate_flags(&r.risk_flags)
            }
            JobResult::ResolveUrlRedirects(r) => {
                validate_optional_url("resolved_url", Some(&r.resolved_url))
            }
            JobResult::CheckFreshness(_) | JobResult::Dedupe(_) => Ok(()),
        }
    }
}

fn decode_or_default<T>(raw: &serde_json::Value) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if raw.is_null() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_value(raw.clone())?)
    }
}

fn validate_optional_url(field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) => Url::parse(v)
            .map(|_| ())
            .map_err(|e| GleanerError::validation(format!("{field} is not a URL ({e}): {v}"))),
        None => Ok(()),
    }
}

fn validate_flags(flags: &[String]) -> Result<()> {
    if flags.iter().any(|f| f.trim().is_empty()) {
        return Err(GleanerError::validation("risk flags must not be blank"));
    }
    Ok(())
}
