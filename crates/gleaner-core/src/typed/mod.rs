//! Typed - 型付き Executor API
//!
//! job kind の取り違えを型で排除し、executor との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `JobInput` trait, `Executor<T>` trait - 型安全
//! - **内部（Dyn）**: `DynExecutor` trait - object-safe, type erasure

pub mod executor;
pub mod input;
pub mod registry;

pub use self::executor::{DynExecutor, ExecutionError, Executor, TypedExecutor};
pub use self::input::JobInput;
pub use self::registry::{ExecutorRegistry, RegistryError};
