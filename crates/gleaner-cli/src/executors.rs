//! Offline executors for `run` and `demo`.
//!
//! 外部サービスには触らず、URL から決定的に結果を組み立てます。
//! 本番では抽出・liveness チェックの実装に差し替える前提です。

use async_trait::async_trait;
use url::Url;

use gleaner_core::app::{WorkerBuilder, Workers};
use gleaner_core::domain::{
    DedupeInput, DedupeResult, EnrichInput, EnrichResult, ExtractInput, ExtractResult,
    ExtractedFields, FreshnessInput, FreshnessResult, JobKind, RedirectInput, RedirectResult,
};
use gleaner_core::typed::{ExecutionError, Executor};

/// Title from the last path segment, organization from the host.
pub struct UrlExtractor;

#[async_trait]
impl Executor<ExtractInput> for UrlExtractor {
    async fn execute(&self, input: ExtractInput) -> Result<ExtractResult, ExecutionError> {
        let url = Url::parse(&input.normalized_url)
            .map_err(|e| ExecutionError::new(format!("{}: {e}", input.normalized_url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ExecutionError::new(format!("{} has no host", input.normalized_url)))?;
        let slug = url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .unwrap_or("opportunity");
        Ok(ExtractResult {
            fields: ExtractedFields {
                title: Some(title_case(slug)),
                organization: host.split('.').next().map(title_case),
                ..ExtractedFields::default()
            },
            risk_flags: Vec::new(),
        })
    }
}

/// Treats every posting as reachable.
pub struct AssumeAlive;

#[async_trait]
impl Executor<FreshnessInput> for AssumeAlive {
    async fn execute(&self, _input: FreshnessInput) -> Result<FreshnessResult, ExecutionError> {
        Ok(FreshnessResult {
            alive: true,
            http_status: None,
        })
    }
}

pub struct NoEnrichment;

#[async_trait]
impl Executor<EnrichInput> for NoEnrichment {
    async fn execute(&self, _input: EnrichInput) -> Result<EnrichResult, ExecutionError> {
        Ok(EnrichResult::default())
    }
}

/// Resolves every URL to itself.
pub struct NoRedirects;

#[async_trait]
impl Executor<RedirectInput> for NoRedirects {
    async fn execute(&self, input: RedirectInput) -> Result<RedirectResult, ExecutionError> {
        Ok(RedirectResult {
            resolved_url: input.url,
        })
    }
}

pub struct Rescore;

#[async_trait]
impl Executor<DedupeInput> for Rescore {
    async fn execute(&self, _input: DedupeInput) -> Result<DedupeResult, ExecutionError> {
        Ok(DedupeResult {})
    }
}

pub fn offline_workers() -> anyhow::Result<Workers> {
    let workers = WorkerBuilder::new()
        .register::<ExtractInput, _>(UrlExtractor)?
        .register::<FreshnessInput, _>(AssumeAlive)?
        .register::<EnrichInput, _>(NoEnrichment)?
        .register::<RedirectInput, _>(NoRedirects)?
        .register::<DedupeInput, _>(Rescore)?
        .expect_kinds(&JobKind::ALL)
        .build()?;
    Ok(workers)
}

fn title_case(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_case_splits_slugs() {
        assert_eq!(title_case("weekend-meal_delivery"), "Weekend Meal Delivery");
    }

    #[tokio::test]
    async fn extractor_reads_title_and_org_from_url() {
        let input: ExtractInput = serde_json::from_value(serde_json::json!({
            "discovery_id": "01HZY3K5G1M7ZQ8Y6W4V2T0R9S",
            "source_key": "rss:x",
            "normalized_url": "https://foodshelf.org/jobs/delivery-driver",
            "canonical_hash": "h1",
        }))
        .unwrap();
        let out = UrlExtractor.execute(input).await.unwrap();
        assert_eq!(out.fields.title.as_deref(), Some("Delivery Driver"));
        assert_eq!(out.fields.organization.as_deref(), Some("Foodshelf"));
    }
}
