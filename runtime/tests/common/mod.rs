//! Shared harness for engine tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::time::Duration;
use voucher_core::{Clock, NewBatch, ProfileId, Voucher, VoucherBatch};
use voucher_runtime::{EngineConfig, VoucherEngine};
use voucher_testing::{InMemoryVoucherStore, MockClock, fixtures, test_clock};

pub type Engine = VoucherEngine<InMemoryVoucherStore, MockClock>;

pub struct Harness {
    pub engine: Engine,
    pub store: InMemoryVoucherStore,
    pub clock: MockClock,
    pub profile_id: ProfileId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::new())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        voucher_testing::init_tracing();
        let store = InMemoryVoucherStore::new();
        let profile_id = store.insert_profile(fixtures::profile(1));
        let clock = test_clock();
        let engine = VoucherEngine::with_clock(store.clone(), clock.clone())
            .with_config(config.with_conflict_retries(8, Duration::from_millis(1)));
        Self {
            engine,
            store,
            clock,
            profile_id,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn batch_request(&self, name: &str, total_count: i32) -> NewBatch {
        fixtures::new_batch(name, self.profile_id, total_count, self.now())
    }

    /// Issue a batch and return it with its vouchers.
    pub async fn issue(&self, name: &str, total_count: i32) -> (VoucherBatch, Vec<Voucher>) {
        self.issue_request(self.batch_request(name, total_count)).await
    }

    pub async fn issue_request(&self, request: NewBatch) -> (VoucherBatch, Vec<Voucher>) {
        let batch = self.engine.issue_batch(request).await.unwrap();
        let vouchers = self.store.vouchers_of(batch.id);
        (batch, vouchers)
    }
}
