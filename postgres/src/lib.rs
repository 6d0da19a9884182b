//! `PostgreSQL` voucher store for the voucher engine.
//!
//! This crate implements the `VoucherStore` trait from `voucher-core` on top
//! of sqlx and provides:
//!
//! - Row locking with `SELECT ... FOR UPDATE` for exactly-once redemption
//! - Conditional status updates and atomic `used_count` increments
//! - Mapping of serialization failures and deadlocks to retryable conflicts
//! - Bundled schema migrations
//! - Connection pool configuration from the environment
//!
//! # Example
//!
//! ```ignore
//! use voucher_postgres::{PostgresConfig, PostgresVoucherStore};
//! use voucher_runtime::VoucherEngine;
//!
//! async fn example() -> voucher_core::Result<()> {
//!     let store = PostgresVoucherStore::connect(&PostgresConfig::from_env()).await?;
//!     store.migrate().await?;
//!     let engine = VoucherEngine::new(store);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod store;

pub use config::PostgresConfig;
pub use store::{PostgresTransaction, PostgresVoucherStore};
