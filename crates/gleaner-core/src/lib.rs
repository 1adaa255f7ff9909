//! gleaner-core
//!
//! Volunteer-opportunity ingestion core: a lease-based job ledger, dedupe
//! scoring, trust-policy routing, and the candidate / posting lifecycles,
//! all writing through one transactional store with a provenance trail.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, candidate, posting, merge, policy, provenance, errors）
//! - **ports**: 抽象化レイヤー（Store/Tx, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStore）
//! - **ledger**: Job Ledger（claim / submit_result / reap）
//! - **dedupe / policy / router**: 重複判定・信頼ポリシー・merge routing
//! - **lifecycle**: Candidate / Posting の状態機械
//! - **pipeline**: 外部コラボレータ向けの facade（1 呼び出し = 1 トランザクション）
//! - **typed / app**: 型付き executor API と常駐ループ
//! - **config**: `gleaner.toml` + 環境変数

pub mod app;
pub mod config;
pub mod dedupe;
pub mod domain;
pub mod effects;
pub mod impls;
pub mod ledger;
pub mod lifecycle;
pub mod pipeline;
pub mod policy;
pub mod ports;
pub mod provenance;
pub mod router;
pub mod typed;

pub use config::GleanerConfig;
pub use domain::{GleanerError, Result};
pub use pipeline::{DiscoveryIntake, Pipeline};
