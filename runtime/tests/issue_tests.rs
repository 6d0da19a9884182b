//! Batch issuance against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::Harness;
use proptest::prelude::*;
use std::collections::HashSet;
use voucher_core::{BatchStatus, ProfileId, VoucherError, VoucherStatus};
use voucher_runtime::EngineConfig;
use voucher_testing::{FailPoint, properties};

#[tokio::test]
async fn test_issue_prefixed_batch() {
    let h = Harness::new();
    let mut request = h.batch_request("VIP launch", 5);
    request.prefix = "vip".to_string();
    request.code_length = 8;

    let (batch, vouchers) = h.issue_request(request).await;

    assert_eq!(batch.prefix, "VIP");
    assert_eq!(batch.status, BatchStatus::Enabled);
    assert_eq!(batch.used_count, 0);
    assert_eq!(vouchers.len(), 5);

    let codes: HashSet<_> = vouchers.iter().map(|v| v.code.clone()).collect();
    assert_eq!(codes.len(), 5);
    for voucher in &vouchers {
        assert!(voucher.code.starts_with("VIP"));
        assert_eq!(voucher.code.len(), 3 + 8);
        assert!(voucher.code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_eq!(voucher.status, VoucherStatus::Available);
        assert_eq!(voucher.batch_id, batch.id);
        assert_eq!(voucher.profile_id, batch.profile_id);
        assert_eq!(voucher.expire_time, Some(batch.expire_time));
        assert_eq!(voucher.user_id, None);
        assert_eq!(voucher.redeemed_at, None);
    }
}

#[tokio::test]
async fn test_short_code_length_uses_default() {
    let h = Harness::with_config(EngineConfig::new().with_default_code_length(12));
    let mut request = h.batch_request("short", 3);
    request.code_length = 4;

    let (batch, vouchers) = h.issue_request(request).await;

    assert_eq!(batch.code_length, 12);
    assert!(vouchers.iter().all(|v| v.code.len() == 12));
}

#[tokio::test]
async fn test_large_batch_is_inserted_in_chunks() {
    let h = Harness::with_config(EngineConfig::new().with_insert_chunk_size(100));
    let (batch, vouchers) = h.issue("bulk", 250).await;

    assert_eq!(batch.total_count, 250);
    assert_eq!(vouchers.len(), 250);
    assert_eq!(h.store.commits(), 1);
}

#[tokio::test]
async fn test_unknown_profile_writes_nothing() {
    let h = Harness::new();
    let mut request = h.batch_request("orphan", 5);
    request.profile_id = ProfileId(404);

    let err = h.engine.issue_batch(request).await.unwrap_err();

    assert_eq!(err, VoucherError::ProfileNotFound(ProfileId(404)));
    assert_eq!(h.store.batch_count(), 0);
    assert_eq!(h.store.voucher_count(), 0);
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let h = Harness::new();
    h.issue("Summer", 1).await;

    let err = h
        .engine
        .issue_batch(h.batch_request("  Summer  ", 1))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        VoucherError::BatchNameExists {
            name: "Summer".to_string()
        }
    );
    assert_eq!(h.store.batch_count(), 1);
    assert_eq!(h.store.voucher_count(), 1);
}

#[tokio::test]
async fn test_validation_runs_before_any_transaction() {
    let h = Harness::new();

    for total_count in [0, 10_001] {
        let err = h
            .engine
            .issue_batch(h.batch_request("bad", total_count))
            .await
            .unwrap_err();
        assert!(matches!(err, VoucherError::Validation { field: "total_count", .. }));
    }

    assert_eq!(h.store.commits(), 0);
    assert_eq!(h.store.rollbacks(), 0);
}

#[tokio::test]
async fn test_insert_failure_rolls_back_whole_batch() {
    let h = Harness::with_config(EngineConfig::new().with_insert_chunk_size(10));
    h.store.fail_on(FailPoint::InsertVouchers);

    let err = h.engine.issue_batch(h.batch_request("doomed", 50)).await.unwrap_err();

    assert!(matches!(err, VoucherError::Storage(_)));
    assert_eq!(err.code(), "DATABASE_ERROR");
    assert_eq!(h.store.batch_count(), 0);
    assert_eq!(h.store.voucher_count(), 0);
    assert_eq!(h.store.rollbacks(), 1);

    h.store.clear_failures();
    let (_, vouchers) = h.issue("doomed", 50).await;
    assert_eq!(vouchers.len(), 50);
}

#[tokio::test]
async fn test_commit_conflict_is_retried() {
    let h = Harness::new();
    h.store.fail_once(
        FailPoint::Commit,
        VoucherError::TransactionConflict("duplicate voucher code".into()),
    );

    let (batch, vouchers) = h.issue("retried", 20).await;

    assert_eq!(vouchers.len(), 20);
    assert_eq!(h.store.vouchers_of(batch.id).len(), 20);
    assert_eq!(h.store.batch_count(), 1);
}

#[tokio::test]
async fn test_storage_collisions_are_redrawn() {
    let h = Harness::new();
    h.store.collide_next(3);

    let (batch, vouchers) = h.issue("redrawn", 10).await;

    let reported = h.store.reported_collisions();
    assert_eq!(reported.len(), 3);
    assert_eq!(batch.total_count, 10);
    assert_eq!(vouchers.len(), 10);
    let codes: HashSet<_> = vouchers.iter().map(|v| v.code.clone()).collect();
    assert_eq!(codes.len(), 10);
    assert!(reported.iter().all(|code| !codes.contains(code)));
    assert_eq!(h.store.commits(), 1);
}

#[tokio::test]
async fn test_generation_exhausted_rolls_back_batch() {
    let h = Harness::with_config(EngineConfig::new().with_code_retry_factor(4));
    h.store.collide_all();

    let err = h
        .engine
        .issue_batch(h.batch_request("exhausted", 5))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        VoucherError::GenerationExhausted {
            attempts: 20,
            generated: 0,
            requested: 5,
        }
    );
    assert_eq!(err.code(), "GENERATE_FAILED");
    assert_eq!(h.store.batch_count(), 0);
    assert_eq!(h.store.voucher_count(), 0);
    assert_eq!(h.store.rollbacks(), 1);
    assert_eq!(h.store.commits(), 0);

    // The name was never taken.
    h.store.clear_failures();
    h.issue("exhausted", 5).await;
}

#[tokio::test]
async fn test_codes_unique_across_batches() {
    let h = Harness::new();
    let mut seen = HashSet::new();
    for i in 0..5 {
        let mut request = h.batch_request(&format!("b{i}"), 200);
        request.code_length = 6;
        let (_, vouchers) = h.issue_request(request).await;
        for voucher in vouchers {
            assert!(seen.insert(voucher.code), "duplicate code across batches");
        }
    }
    assert_eq!(seen.len(), 1000);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_issue_yields_exact_count_of_formatted_codes(
        prefix in properties::prefix(),
        code_length in properties::code_length(),
        total_count in properties::small_count(),
    ) {
        tokio_test::block_on(async {
            let h = Harness::new();
            let mut request = h.batch_request("prop", total_count);
            request.prefix = prefix.clone();
            request.code_length = code_length;

            let (batch, vouchers) = h.issue_request(request).await;

            let expected_prefix = prefix.to_ascii_uppercase();
            let expected_len = prefix.len() + usize::try_from(code_length).unwrap();
            prop_assert_eq!(vouchers.len(), usize::try_from(total_count).unwrap());
            let codes: HashSet<_> = vouchers.iter().map(|v| v.code.as_str()).collect();
            prop_assert_eq!(codes.len(), vouchers.len());
            for voucher in &vouchers {
                prop_assert!(voucher.code.starts_with(&expected_prefix));
                prop_assert_eq!(voucher.code.len(), expected_len);
                prop_assert_eq!(voucher.batch_id, batch.id);
                prop_assert_eq!(voucher.status, VoucherStatus::Available);
            }
            Ok(())
        })?;
    }
}
