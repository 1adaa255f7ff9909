//! App - アプリケーション層
//!
//! `Pipeline` の操作を組み合わせて、常駐するループを実装します。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: executor の登録と起動時検証
//! - **WorkerGroup / WorkerLoop**: job 実行ループ（list → claim → execute → submit）
//! - **ReaperLoop**: lease 期限切れの回収
//! - **FreshnessLoop**: posting の liveness チェック投入
//! - **StatusReport**: queue の状況

pub mod backoff;
pub mod builder;
pub mod freshness_loop;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::backoff::PollBackoff;
pub use self::builder::{BuildError, WorkerBuilder, Workers};
pub use self::freshness_loop::FreshnessLoop;
pub use self::reaper_loop::ReaperLoop;
pub use self::status::StatusReport;
pub use self::worker_loop::{WorkerGroup, WorkerLoop};
