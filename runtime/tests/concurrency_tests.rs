//! Concurrent redemption, deletion and issuance.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::Harness;
use futures::future::join_all;
use std::sync::Arc;
use voucher_core::{RedeemRequest, VoucherError, VoucherStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_code_redeemed_exactly_once() {
    let h = Arc::new(Harness::new());
    let (batch, vouchers) = h.issue("contested", 1).await;
    let code = vouchers[0].code.clone();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let h = Arc::clone(&h);
            let code = code.clone();
            tokio::spawn(async move {
                h.engine
                    .redeem(RedeemRequest::new(code, format!("user{i:02}"), "password1"))
                    .await
            })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one redemption must win: {results:?}");
    for result in results.iter().filter(|r| r.is_err()) {
        assert_eq!(
            result.as_ref().unwrap_err(),
            &VoucherError::VoucherNotAvailable {
                status: VoucherStatus::Used
            }
        );
    }

    assert_eq!(h.store.accounts().len(), 1);
    assert_eq!(h.store.batch(batch.id).unwrap().used_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_used_count_matches_used_vouchers_under_load() {
    let h = Arc::new(Harness::new());
    let (batch, vouchers) = h.issue("busy", 30).await;

    // Every code is attempted twice, from different users.
    let handles: Vec<_> = vouchers
        .iter()
        .flat_map(|v| [(v.code.clone(), 0), (v.code.clone(), 1)])
        .enumerate()
        .map(|(i, (code, _))| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                h.engine
                    .redeem(RedeemRequest::new(code, format!("load{i:03}"), "password1"))
                    .await
            })
        })
        .collect();

    let successes = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| joined.as_ref().is_ok_and(Result::is_ok))
        .count();

    let stored = h.store.vouchers_of(batch.id);
    let used = stored
        .iter()
        .filter(|v| v.status == VoucherStatus::Used)
        .count();
    assert_eq!(successes, 30);
    assert_eq!(used, 30);
    assert_eq!(
        usize::try_from(h.store.batch(batch.id).unwrap().used_count).unwrap(),
        used
    );
    assert!(stored.iter().all(|v| v.user_id.is_some() == v.redeemed_at.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_and_redeem_race_keeps_invariant() {
    for round in 0..10 {
        let h = Arc::new(Harness::new());
        let (batch, vouchers) = h.issue(&format!("race{round}"), 1).await;
        let code = vouchers[0].code.clone();

        let redeem = {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                h.engine
                    .redeem(RedeemRequest::new(code, "racer", "password1"))
                    .await
            })
        };
        let delete = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.engine.delete_batch(batch.id).await })
        };

        let redeemed = redeem.await.unwrap();
        let deleted = delete.await.unwrap();

        match (&redeemed, &deleted) {
            (Ok(_), Err(VoucherError::BatchInUse { used: 1 })) => {
                let stored = h.store.batch(batch.id).unwrap();
                assert!(stored.deleted_at.is_none());
                assert_eq!(stored.used_count, 1);
            }
            (Err(VoucherError::VoucherNotFound), Ok(())) => {
                assert!(h.store.accounts().is_empty());
                assert!(h.store.batch(batch.id).unwrap().deleted_at.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_issue_with_same_name() {
    let h = Arc::new(Harness::new());

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.engine.issue_batch(h.batch_request("launch", 10)).await })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        VoucherError::BatchNameExists { name } if name == "launch"
    )));
    assert_eq!(h.store.batch_count(), 1);
    assert_eq!(h.store.voucher_count(), 10);
}
