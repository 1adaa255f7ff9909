//! Ports - 抽象化レイヤー
//!
//! core が外部に要求するものはここに trait として置きます。
//! - Store: トランザクション単位の永続化（正本）
//! - Clock: 現在時刻
//! - IdGenerator: ULID 生成

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator, next_id};
pub use self::store::{Store, Tx, in_transaction};
