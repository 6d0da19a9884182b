//! Administrative voucher and batch operations.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use chrono::Duration;
use common::Harness;
use voucher_core::{
    BatchFilter, BatchId, BatchStatus, BatchUpdate, ProfileId, RedeemRequest, VoucherBatch,
    VoucherError, VoucherId, VoucherStatus,
};

// ============================================================================
// DisableVoucher
// ============================================================================

#[tokio::test]
async fn test_disable_available_voucher() {
    let h = Harness::new();
    let (_, vouchers) = h.issue("withdraw", 1).await;
    h.store.set_voucher_password(vouchers[0].id, Some("1234"));

    let disabled = h.engine.disable_voucher(vouchers[0].id).await.unwrap();

    assert_eq!(disabled.status, VoucherStatus::Disabled);
    assert_eq!(disabled.password, None);
    assert_eq!(h.store.voucher(vouchers[0].id).unwrap().status, VoucherStatus::Disabled);

    let request = RedeemRequest::new(vouchers[0].code.clone(), "alice", "password1")
        .with_voucher_password("1234");
    let err = h.engine.redeem(request).await.unwrap_err();
    assert_eq!(
        err,
        VoucherError::VoucherNotAvailable {
            status: VoucherStatus::Disabled
        }
    );
}

#[tokio::test]
async fn test_disable_expired_voucher() {
    let h = Harness::new();
    let (batch, vouchers) = h.issue("lapsed", 1).await;
    h.clock.set(batch.expire_time + Duration::hours(1));
    let err = h
        .engine
        .redeem(RedeemRequest::new(vouchers[0].code.clone(), "bob", "password1"))
        .await
        .unwrap_err();
    assert_eq!(err, VoucherError::VoucherExpired);

    let disabled = h.engine.disable_voucher(vouchers[0].id).await.unwrap();
    assert_eq!(disabled.status, VoucherStatus::Disabled);
}

#[tokio::test]
async fn test_disable_used_voucher_is_illegal() {
    let h = Harness::new();
    let (_, vouchers) = h.issue("spent", 1).await;
    h.engine
        .redeem(RedeemRequest::new(vouchers[0].code.clone(), "carol", "password1"))
        .await
        .unwrap();

    let err = h.engine.disable_voucher(vouchers[0].id).await.unwrap_err();

    assert_eq!(
        err,
        VoucherError::IllegalTransition {
            from: VoucherStatus::Used,
            to: VoucherStatus::Disabled,
        }
    );
    assert_eq!(err.code(), "ILLEGAL_TRANSITION");
    assert_eq!(h.store.voucher(vouchers[0].id).unwrap().status, VoucherStatus::Used);
}

#[tokio::test]
async fn test_disable_twice_is_illegal() {
    let h = Harness::new();
    let (_, vouchers) = h.issue("twice", 1).await;
    h.engine.disable_voucher(vouchers[0].id).await.unwrap();

    let err = h.engine.disable_voucher(vouchers[0].id).await.unwrap_err();

    assert!(matches!(
        err,
        VoucherError::IllegalTransition {
            from: VoucherStatus::Disabled,
            ..
        }
    ));
}

#[tokio::test]
async fn test_disable_unknown_voucher() {
    let h = Harness::new();
    let err = h.engine.disable_voucher(VoucherId(999)).await.unwrap_err();
    assert_eq!(err, VoucherError::VoucherIdNotFound(VoucherId(999)));
}

// ============================================================================
// DeleteBatch
// ============================================================================

#[tokio::test]
async fn test_delete_batch_with_used_voucher_rejected() {
    let h = Harness::new();
    let (batch, vouchers) = h.issue("keep", 3).await;
    h.engine
        .redeem(RedeemRequest::new(vouchers[0].code.clone(), "dave", "password1"))
        .await
        .unwrap();

    let err = h.engine.delete_batch(batch.id).await.unwrap_err();

    assert_eq!(err, VoucherError::BatchInUse { used: 1 });
    assert_eq!(err.code(), "IN_USE");
    assert!(h.store.batch(batch.id).unwrap().deleted_at.is_none());
    assert!(h.store.vouchers_of(batch.id).iter().all(|v| v.deleted_at.is_none()));
}

#[tokio::test]
async fn test_delete_batch_removes_its_vouchers() {
    let h = Harness::new();
    let (batch, vouchers) = h.issue("gone", 3).await;
    h.store
        .set_voucher_expire_time(vouchers[0].id, Some(h.now() - Duration::seconds(1)));
    let err = h
        .engine
        .redeem(RedeemRequest::new(vouchers[0].code.clone(), "erin", "password1"))
        .await
        .unwrap_err();
    assert_eq!(err, VoucherError::VoucherExpired);

    h.engine.delete_batch(batch.id).await.unwrap();

    assert!(h.store.batch(batch.id).unwrap().deleted_at.is_some());
    assert!(h.store.vouchers_of(batch.id).iter().all(|v| v.deleted_at.is_some()));
    assert_eq!(
        h.engine.get_batch(batch.id).await.unwrap_err(),
        VoucherError::BatchNotFound(batch.id)
    );
    assert_eq!(
        h.engine.list_vouchers(batch.id).await.unwrap_err(),
        VoucherError::BatchNotFound(batch.id)
    );
    let err = h
        .engine
        .redeem(RedeemRequest::new(vouchers[1].code.clone(), "frank", "password1"))
        .await
        .unwrap_err();
    assert_eq!(err, VoucherError::VoucherNotFound);

    // The name is free again.
    h.issue("gone", 1).await;
}

#[tokio::test]
async fn test_delete_unknown_batch() {
    let h = Harness::new();
    let err = h.engine.delete_batch(BatchId(77)).await.unwrap_err();
    assert_eq!(err, VoucherError::BatchNotFound(BatchId(77)));
}

// ============================================================================
// UpdateBatch and lookups
// ============================================================================

#[tokio::test]
async fn test_update_batch_applies_present_fields() {
    let h = Harness::new();
    let (batch, vouchers) = h.issue("original", 2).await;
    h.clock.advance(Duration::minutes(5));

    let updated = h
        .engine
        .update_batch(
            batch.id,
            BatchUpdate {
                name: Some("  renamed ".into()),
                valid_days: Some(14),
                remark: Some("reprinted".into()),
                ..BatchUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.valid_days, 14);
    assert_eq!(updated.remark, "reprinted");
    assert_eq!(updated.status, BatchStatus::Enabled);
    assert_eq!(updated.expire_time, batch.expire_time);
    assert_eq!(updated.updated_at, h.now());
    assert_eq!(h.store.batch(batch.id).unwrap(), updated);

    // Vouchers keep their codes.
    let listed = h.engine.list_vouchers(batch.id).await.unwrap();
    let mut codes: Vec<_> = listed.iter().map(|v| v.code.clone()).collect();
    let mut original: Vec<_> = vouchers.iter().map(|v| v.code.clone()).collect();
    codes.sort();
    original.sort();
    assert_eq!(codes, original);
}

#[tokio::test]
async fn test_update_batch_rejects_conflicts() {
    let h = Harness::new();
    let (first, _) = h.issue("first", 1).await;
    h.issue("second", 1).await;

    let err = h
        .engine
        .update_batch(
            first.id,
            BatchUpdate {
                name: Some("second".into()),
                ..BatchUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        VoucherError::BatchNameExists {
            name: "second".into()
        }
    );

    let err = h
        .engine
        .update_batch(
            first.id,
            BatchUpdate {
                profile_id: Some(ProfileId(42)),
                ..BatchUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, VoucherError::ProfileNotFound(ProfileId(42)));

    let err = h
        .engine
        .update_batch(
            first.id,
            BatchUpdate {
                valid_days: Some(4000),
                ..BatchUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VoucherError::Validation { field: "valid_days", .. }));

    // Keeping its own name is not a conflict.
    h.engine
        .update_batch(
            first.id,
            BatchUpdate {
                name: Some("first".into()),
                ..BatchUpdate::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_update_returns_batch_unchanged() {
    let h = Harness::new();
    let (batch, _) = h.issue("noop", 1).await;
    let commits = h.store.commits();

    let same = h
        .engine
        .update_batch(batch.id, BatchUpdate::default())
        .await
        .unwrap();

    assert_eq!(same, batch);
    assert_eq!(h.store.commits(), commits + 1);
}

#[tokio::test]
async fn test_lookups_clear_passwords() {
    let h = Harness::new();
    let (batch, vouchers) = h.issue("lookup", 2).await;
    h.store.set_voucher_password(vouchers[0].id, Some("1234"));

    let voucher = h.engine.get_voucher(vouchers[0].id).await.unwrap();
    assert_eq!(voucher.code, vouchers[0].code);
    assert_eq!(voucher.password, None);

    let listed = h.engine.list_vouchers(batch.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|v| v.password.is_none()));
    assert!(listed.windows(2).all(|w| w[0].id < w[1].id));

    assert_eq!(h.engine.get_batch(batch.id).await.unwrap(), batch);
    assert_eq!(
        h.engine.get_voucher(VoucherId(12345)).await.unwrap_err(),
        VoucherError::VoucherIdNotFound(VoucherId(12345))
    );
}

// ============================================================================
// ListBatches
// ============================================================================

#[tokio::test]
async fn test_list_batches_filters_live_batches() {
    let h = Harness::new();
    let (summer, _) = h.issue("Summer Promo", 1).await;
    let (winter, _) = h.issue("Winter Promo", 1).await;
    let (trial, _) = h.issue("Trial", 1).await;
    let (retired, _) = h.issue("Retired promo", 1).await;
    h.engine
        .update_batch(
            winter.id,
            BatchUpdate {
                status: Some(BatchStatus::Disabled),
                ..BatchUpdate::default()
            },
        )
        .await
        .unwrap();
    h.engine.delete_batch(retired.id).await.unwrap();

    let ids = |batches: Vec<VoucherBatch>| -> Vec<BatchId> {
        batches.into_iter().map(|b| b.id).collect()
    };

    let all = h.engine.list_batches(BatchFilter::default()).await.unwrap();
    assert_eq!(ids(all), vec![summer.id, winter.id, trial.id]);

    let promos = h
        .engine
        .list_batches(BatchFilter {
            name: Some("  PROMO ".to_string()),
            ..BatchFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(promos), vec![summer.id, winter.id]);

    let enabled_promos = h
        .engine
        .list_batches(BatchFilter {
            status: Some(BatchStatus::Enabled),
            name: Some("promo".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(ids(enabled_promos), vec![summer.id]);

    let disabled = h
        .engine
        .list_batches(BatchFilter {
            status: Some(BatchStatus::Disabled),
            name: None,
        })
        .await
        .unwrap();
    assert_eq!(disabled.len(), 1);
    assert_eq!(disabled[0].status, BatchStatus::Disabled);
    assert_eq!(disabled[0].id, winter.id);
}
