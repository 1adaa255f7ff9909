//! Impls - port の実装
//!
//! - InMemoryStore: 開発・テスト用のトランザクショナル Store

pub mod inmem_store;

pub use inmem_store::InMemoryStore;
