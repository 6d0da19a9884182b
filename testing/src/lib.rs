//! # Voucher Testing
//!
//! Testing utilities for the voucher engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`MockClock`])
//! - [`InMemoryVoucherStore`], a row-locking store with failure injection
//! - Fixtures for profiles and batch requests
//! - Property-based testing strategies
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use voucher_runtime::VoucherEngine;
//! use voucher_testing::{InMemoryVoucherStore, fixtures, test_clock};
//!
//! #[tokio::test]
//! async fn test_issue() {
//!     let store = InMemoryVoucherStore::new();
//!     let profile_id = store.insert_profile(fixtures::profile(1));
//!     let clock = test_clock();
//!     let engine = VoucherEngine::with_clock(store.clone(), clock.clone());
//!
//!     let batch = engine
//!         .issue_batch(fixtures::new_batch("promo", profile_id, 5, clock.now()))
//!         .await
//!         .unwrap();
//!     assert_eq!(store.vouchers_of(batch.id).len(), 5);
//! }
//! ```

use chrono::{DateTime, Utc};
use voucher_core::environment::Clock;

/// In-memory voucher store
pub mod memory;

/// Mock implementations of injected dependencies.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use voucher_testing::mocks::FixedClock;
    /// use voucher_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that tests can move forward.
    ///
    /// Clones share the same time, so a test can keep a handle after
    /// handing one to the engine. Precision is one millisecond.
    ///
    /// # Example
    ///
    /// ```
    /// use voucher_testing::mocks::MockClock;
    /// use voucher_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = MockClock::new(chrono::Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::days(1));
    /// assert_eq!(clock.now() - before, Duration::days(1));
    /// ```
    #[derive(Debug, Clone)]
    pub struct MockClock {
        millis: Arc<AtomicI64>,
    }

    impl MockClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(time.timestamp_millis())),
            }
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
        }

        /// Move forward by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
        }
    }

    /// Create a default clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> MockClock {
        MockClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Fixtures for common test data.
pub mod fixtures {
    use super::{DateTime, Utc};
    use chrono::Duration;
    use voucher_core::{BillingProfile, NewBatch, NodeId, ProfileId};

    /// A billing profile with distinctive network attributes.
    #[must_use]
    pub fn profile(id: i64) -> BillingProfile {
        BillingProfile {
            id: ProfileId(id),
            name: format!("profile-{id}"),
            addr_pool: "pool-a".to_string(),
            active_num: 2,
            up_rate: 1024,
            down_rate: 4096,
            domain: "isp.example".to_string(),
            bind_mac: true,
            bind_vlan: false,
        }
    }

    /// A batch request expiring 90 days after `now`, with no prefix,
    /// default code length and no post-redemption validity window.
    #[must_use]
    pub fn new_batch(
        name: &str,
        profile_id: ProfileId,
        total_count: i32,
        now: DateTime<Utc>,
    ) -> NewBatch {
        NewBatch {
            name: name.to_string(),
            node_id: NodeId(1),
            profile_id,
            total_count,
            expire_time: now + Duration::days(90),
            valid_days: 0,
            prefix: String::new(),
            code_length: 10,
            status: None,
            remark: String::new(),
        }
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Valid code prefixes, in mixed case.
    pub fn prefix() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9]{0,10}"
    }

    /// Valid code lengths.
    pub fn code_length() -> impl Strategy<Value = i32> {
        6i32..=32
    }

    /// Small batch sizes.
    pub fn small_count() -> impl Strategy<Value = i32> {
        1i32..=50
    }
}

/// Install a `tracing` subscriber for tests.
///
/// Honours `RUST_LOG` and writes through the test harness's captured
/// output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub use memory::{FailPoint, InMemoryTransaction, InMemoryVoucherStore};
pub use mocks::{FixedClock, MockClock, test_clock};
