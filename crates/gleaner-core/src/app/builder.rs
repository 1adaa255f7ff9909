//! WorkerBuilder - executor の登録と起動時検証
//!
//! # Fail-fast 設計
//! - `expect_kinds()` で処理すべき job kind を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `BuildError` を返し、worker は起動しない

use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::domain::JobKind;
use crate::pipeline::Pipeline;
use crate::typed::{Executor, ExecutorRegistry, JobInput, RegistryError};

use super::worker_loop::WorkerGroup;

/// # 使用例
/// ```ignore
/// let workers = WorkerBuilder::new()
///     .register::<ExtractInput, _>(LlmExtractor::new(client))?
///     .register::<FreshnessInput, _>(HttpProbe)?
///     .expect_kinds(&[JobKind::Extract, JobKind::CheckFreshness])
///     .build()?;
/// let group = workers.spawn(pipeline, &config.worker);
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    registry: ExecutorRegistry,
    expected_kinds: Option<Vec<JobKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing executors for job kinds {0:?}: these kinds were expected but not registered")]
    MissingExecutors(Vec<JobKind>),
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: JobInput, E: Executor<T> + 'static>(
        mut self,
        executor: E,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, E>(executor)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[JobKind]) -> Self {
        self.expected_kinds = Some(kinds.to_vec());
        self
    }

    pub fn build(self) -> Result<Workers, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let registered = self.registry.registered_kinds();
            let missing: Vec<JobKind> = expected
                .iter()
                .filter(|k| !registered.contains(k))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingExecutors(missing));
            }
        }
        Ok(Workers {
            registry: Arc::new(self.registry),
        })
    }
}

/// Validated executor set, ready to spawn worker loops.
pub struct Workers {
    registry: Arc<ExecutorRegistry>,
}

impl Workers {
    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn spawn(&self, pipeline: Pipeline, config: &WorkerConfig) -> WorkerGroup {
        WorkerGroup::spawn(pipeline, Arc::clone(&self.registry), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DedupeInput, DedupeResult};
    use crate::typed::ExecutionError;
    use async_trait::async_trait;

    struct NoopDedupe;

    #[async_trait]
    impl Executor<DedupeInput> for NoopDedupe {
        async fn execute(&self, _input: DedupeInput) -> Result<DedupeResult, ExecutionError> {
            Ok(DedupeResult {})
        }
    }

    #[test]
    fn build_succeeds_when_expected_kinds_are_registered() {
        let workers = WorkerBuilder::new()
            .register::<DedupeInput, _>(NoopDedupe)
            .unwrap()
            .expect_kinds(&[JobKind::Dedupe])
            .build();
        assert!(workers.is_ok());
    }

    #[test]
    fn build_reports_missing_kinds() {
        let workers = WorkerBuilder::new()
            .register::<DedupeInput, _>(NoopDedupe)
            .unwrap()
            .expect_kinds(&[JobKind::Dedupe, JobKind::Extract, JobKind::CheckFreshness])
            .build();
        assert!(matches!(
            workers,
            Err(BuildError::MissingExecutors(missing))
                if missing == vec![JobKind::Extract, JobKind::CheckFreshness]
        ));
    }

    #[test]
    fn build_without_expectations_accepts_anything() {
        assert!(WorkerBuilder::new().build().is_ok());
    }
}
