//! JobInput trait - job kind と入力/出力の型を対応付ける
//!
//! `KIND` は associated const なので、executor の登録時に kind の取り違えが
//! 起きません。`Output` は submit_result に渡す result payload の型です。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{
    DedupeInput, DedupeResult, EnrichInput, EnrichResult, ExtractInput, ExtractResult,
    FreshnessInput, FreshnessResult, JobKind, RedirectInput, RedirectResult,
};

/// # Trait Bounds
/// - `DeserializeOwned`: `Job.inputs` からの復元
/// - `Send + Sync + 'static`: worker task 間で共有するため
pub trait JobInput: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: JobKind;

    /// Result payload reported as `done`.
    type Output: Serialize + Send + 'static;
}

impl JobInput for ExtractInput {
    const KIND: JobKind = JobKind::Extract;
    type Output = ExtractResult;
}

impl JobInput for FreshnessInput {
    const KIND: JobKind = JobKind::CheckFreshness;
    type Output = FreshnessResult;
}

impl JobInput for EnrichInput {
    const KIND: JobKind = JobKind::Enrich;
    type Output = EnrichResult;
}

impl JobInput for RedirectInput {
    const KIND: JobKind = JobKind::ResolveUrlRedirects;
    type Output = RedirectResult;
}

impl JobInput for DedupeInput {
    const KIND: JobKind = JobKind::Dedupe;
    type Output = DedupeResult;
}
