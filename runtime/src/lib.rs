//! # Voucher Runtime
//!
//! The voucher lifecycle engine: batch issuance, exactly-once redemption
//! and administrative operations over any [`VoucherStore`].
//!
//! ## Core Components
//!
//! - **`VoucherEngine`**: runs every public operation as one store transaction
//! - **Retry**: re-runs transactions that lost a race ([`retry`])
//! - **Metrics**: Prometheus counters and histograms ([`metrics`])
//!
//! ## Example
//!
//! ```ignore
//! use voucher_runtime::{EngineConfig, VoucherEngine};
//! use voucher_postgres::PostgresVoucherStore;
//!
//! let store = PostgresVoucherStore::new(pool);
//! let engine = VoucherEngine::new(store).with_config(EngineConfig::from_env());
//!
//! let batch = engine.issue_batch(new_batch).await?;
//! let redemption = engine
//!     .redeem(RedeemRequest::new("VIP3K9X2A1B", "alice", "s3cret!"))
//!     .await?;
//! ```

use voucher_core::{Clock, Result, SystemClock, VoucherStore, VoucherTransaction};

/// Administrative batch and voucher operations
mod admin;

/// Engine configuration
pub mod config;

/// Batch issuance
mod issue;

/// Prometheus metrics for observability
pub mod metrics;

/// Voucher redemption
mod redeem;

/// Retry logic with exponential backoff
pub mod retry;

pub use config::{EngineConfig, MAX_INSERT_CHUNK_SIZE, PasswordMismatchPolicy};
pub use retry::RetryPolicy;

/// The voucher lifecycle engine.
///
/// Holds no in-process state shared across requests: every operation opens
/// its own store transaction and relies on the store's row locks and
/// conditional updates for mutual exclusion. The engine is therefore safe
/// to share between tasks behind an `Arc`.
///
/// # Type Parameters
///
/// - `S`: Transactional voucher store
/// - `C`: Clock used for deadlines and timestamps
#[derive(Debug, Clone)]
pub struct VoucherEngine<S, C = SystemClock> {
    store: S,
    clock: C,
    config: EngineConfig,
}

impl<S: VoucherStore> VoucherEngine<S, SystemClock> {
    /// Create an engine using the wall clock and default configuration.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S: VoucherStore, C: Clock> VoucherEngine<S, C> {
    /// Create an engine with an injected clock.
    #[must_use]
    pub fn with_clock(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
            config: EngineConfig::default(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Engine clock.
    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }
}

/// Commit `tx` if `result` is `Ok`, otherwise roll it back.
///
/// A rollback failure is logged and the original error is returned.
async fn finish<T, Tx: VoucherTransaction>(tx: Tx, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(
                    error = %rollback_err,
                    original_error = %err,
                    "Failed to roll back voucher transaction"
                );
            }
            Err(err)
        }
    }
}
