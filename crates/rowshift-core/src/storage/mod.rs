//! Storage layer for rowshift.
//!
//! Durable tables on sled with an order-preserving key encoding. Row writes
//! flow through [`DataTxn`] so sync triggers fire in the writer's transaction.

mod config;
mod engine;
mod table;
mod transaction;

pub mod key;

pub use config::StorageConfig;
pub use engine::TableStore;
pub use table::TableDef;
pub use transaction::DataTxn;
