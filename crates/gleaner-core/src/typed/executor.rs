//! Executor trait - claim した job を実行する側の定義
//!
//! - `Executor<T>`: 型付き。`T::KIND` の job しか受け取れない
//! - `DynExecutor`: object-safe。registry に `Arc<dyn DynExecutor>` で格納する
//! - `TypedExecutor<T, E>`: `Executor<T>` を `DynExecutor` に型消去するアダプタ

use std::marker::PhantomData;

use async_trait::async_trait;

use super::input::JobInput;
use crate::domain::{JobKind, JobOutcome};

/// A job execution that did not produce a result. Reported to the ledger as
/// `failed` and retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

impl ExecutionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// # 使用例
/// ```ignore
/// struct HttpProbe;
///
/// #[async_trait]
/// impl Executor<FreshnessInput> for HttpProbe {
///     async fn execute(&self, input: FreshnessInput) -> Result<FreshnessResult, ExecutionError> {
///         let status = probe(&input.url).await.map_err(|e| ExecutionError::new(e.to_string()))?;
///         Ok(FreshnessResult { alive: status < 400, http_status: Some(status) })
///     }
/// }
/// ```
#[async_trait]
pub trait Executor<T: JobInput>: Send + Sync {
    async fn execute(&self, input: T) -> Result<T::Output, ExecutionError>;
}

#[async_trait]
pub trait DynExecutor: Send + Sync {
    /// Decodes `inputs`, runs the job and turns the result into an outcome.
    async fn execute_dyn(&self, inputs: serde_json::Value) -> JobOutcome;

    fn kind(&self) -> JobKind;
}

pub struct TypedExecutor<T: JobInput, E: Executor<T>> {
    executor: E,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JobInput, E: Executor<T>> TypedExecutor<T, E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: JobInput, E: Executor<T>> DynExecutor for TypedExecutor<T, E> {
    async fn execute_dyn(&self, inputs: serde_json::Value) -> JobOutcome {
        let input: T = match serde_json::from_value(inputs) {
            Ok(input) => input,
            Err(e) => return JobOutcome::failed(format!("{} inputs decode: {e}", T::KIND)),
        };
        match self.executor.execute(input).await {
            Ok(output) => match serde_json::to_value(output) {
                Ok(result) => JobOutcome::done(result),
                Err(e) => JobOutcome::failed(format!("{} result encode: {e}", T::KIND)),
            },
            Err(e) => JobOutcome::failed(e.0),
        }
    }

    fn kind(&self) -> JobKind {
        T::KIND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FreshnessInput, FreshnessResult};
    use serde_json::json;

    struct AlwaysAlive;

    #[async_trait]
    impl Executor<FreshnessInput> for AlwaysAlive {
        async fn execute(&self, _input: FreshnessInput) -> Result<FreshnessResult, ExecutionError> {
            Ok(FreshnessResult {
                alive: true,
                http_status: Some(200),
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Executor<FreshnessInput> for Unreachable {
        async fn execute(&self, input: FreshnessInput) -> Result<FreshnessResult, ExecutionError> {
            Err(ExecutionError::new(format!("connect {}: timed out", input.url)))
        }
    }

    #[tokio::test]
    async fn typed_executor_reports_done() {
        let exec = TypedExecutor::<FreshnessInput, _>::new(AlwaysAlive);
        let inputs = json!({ "posting_id": "01HZY3K5G1M7ZQ8Y6W4V2T0R9S", "url": "https://x.org/1" });
        let outcome = exec.execute_dyn(inputs).await;
        assert_eq!(
            outcome,
            JobOutcome::done(json!({ "alive": true, "http_status": 200 }))
        );
        assert_eq!(exec.kind(), JobKind::CheckFreshness);
    }

    #[tokio::test]
    async fn execution_error_becomes_failed() {
        let exec = TypedExecutor::<FreshnessInput, _>::new(Unreachable);
        let inputs = json!({ "posting_id": "01HZY3K5G1M7ZQ8Y6W4V2T0R9S", "url": "https://x.org/1" });
        let outcome = exec.execute_dyn(inputs).await;
        assert!(matches!(outcome, JobOutcome::Failed { error } if error.contains("timed out")));
    }

    #[tokio::test]
    async fn undecodable_inputs_fail_without_running() {
        let exec = TypedExecutor::<FreshnessInput, _>::new(AlwaysAlive);
        let outcome = exec.execute_dyn(json!({ "url": 3 })).await;
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
    }
}
