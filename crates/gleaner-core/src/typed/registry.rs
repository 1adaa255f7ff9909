//! ExecutorRegistry - job kind ごとの executor の登録と管理
//!
//! 初期化時に組み立てて、実行中は読むだけ（`Arc` で worker 間共有）。

use std::collections::BTreeMap;
use std::sync::Arc;

use super::executor::{DynExecutor, Executor, TypedExecutor};
use super::input::JobInput;
use crate::domain::JobKind;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<JobKind, Arc<dyn DynExecutor>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("executor for job kind '{0}' is already registered")]
    AlreadyRegistered(JobKind),
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: JobInput, E: Executor<T> + 'static>(
        &mut self,
        executor: E,
    ) -> Result<(), RegistryError> {
        if self.executors.contains_key(&T::KIND) {
            return Err(RegistryError::AlreadyRegistered(T::KIND));
        }
        self.executors
            .insert(T::KIND, Arc::new(TypedExecutor::new(executor)));
        Ok(())
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn DynExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Registered kinds, in `JobKind` order.
    pub fn registered_kinds(&self) -> Vec<JobKind> {
        self.executors.keys().copied().collect()
    }
}
