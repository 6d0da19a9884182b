use crate::metrics::VoucherMetrics;
use crate::retry::retry_conflicts;
use crate::{VoucherEngine, finish};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use std::time::Instant;
use voucher_core::code::normalize_code;
use voucher_core::lifecycle::{self, Transition};
use voucher_core::{
    BatchStatus, Clock, NewAccount, RedeemRequest, Redemption, Result, VoucherError,
    VoucherStatus, VoucherStore, VoucherTransaction,
};

/// How a redemption transaction ended.
enum Attempt {
    Redeemed(Redemption),
    /// The voucher was found past its deadline and moved to `expired`.
    /// The transaction commits so the expiry is durable.
    Expired,
}

impl<S: VoucherStore, C: Clock> VoucherEngine<S, C> {
    /// Exchange a voucher code for a new network access account.
    ///
    /// The voucher row is locked for the whole transaction and the final
    /// `available -> used` write is conditional, so for a given code at most
    /// one redemption ever commits. A loser of the race that slipped past
    /// the lock is retried and then observes `VoucherNotAvailable`.
    ///
    /// The returned account and voucher carry no passwords.
    ///
    /// # Errors
    ///
    /// - [`VoucherError::Validation`] for a malformed request
    /// - [`VoucherError::VoucherNotFound`] for an unknown code
    /// - [`VoucherError::VoucherExpired`] if the deadline has passed
    /// - [`VoucherError::VoucherNotAvailable`] if the voucher is not `available`
    /// - [`VoucherError::InvalidVoucherPassword`] for a wrong voucher
    ///   password (or `VoucherNotFound` when masking is configured)
    /// - [`VoucherError::BatchDisabled`] if the owning batch is disabled
    /// - [`VoucherError::UsernameExists`] if the username is taken
    /// - [`VoucherError::ProfileNotFound`] if the billing profile is gone
    /// - storage errors from the store
    #[tracing::instrument(skip(self, request), fields(username = %request.username.trim()))]
    pub async fn redeem(&self, request: RedeemRequest) -> Result<Redemption> {
        let started = Instant::now();
        let result = self.redeem_with_retry(&request).await;

        match &result {
            Ok(redemption) => {
                tracing::info!(
                    voucher_id = %redemption.voucher.id,
                    batch_id = %redemption.voucher.batch_id,
                    user_id = %redemption.account.id,
                    "Voucher redeemed"
                );
                VoucherMetrics::record_redeem(started.elapsed());
            }
            Err(err) => {
                tracing::info!(error = %err, code = err.code(), "Voucher redemption rejected");
                VoucherMetrics::record_redeem_failure(err);
            }
        }
        result
    }

    async fn redeem_with_retry(&self, request: &RedeemRequest) -> Result<Redemption> {
        request.validate()?;
        let code = &normalize_code(&request.code);

        let attempt = retry_conflicts(&self.config.conflict_retry, || async move {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let result = self.redeem_in(&mut tx, code, request, now).await;
            finish(tx, result).await
        })
        .await?;

        match attempt {
            Attempt::Redeemed(redemption) => Ok(redemption),
            Attempt::Expired => Err(VoucherError::VoucherExpired),
        }
    }

    async fn redeem_in(
        &self,
        tx: &mut S::Tx,
        code: &str,
        request: &RedeemRequest,
        now: DateTime<Utc>,
    ) -> Result<Attempt> {
        let voucher = tx
            .lock_voucher_by_code(code)
            .await?
            .ok_or(VoucherError::VoucherNotFound)?;
        let batch = tx
            .get_batch(voucher.batch_id)
            .await?
            .ok_or(VoucherError::VoucherNotFound)?;

        if voucher.status != VoucherStatus::Available {
            return Err(VoucherError::VoucherNotAvailable {
                status: voucher.status,
            });
        }

        if lifecycle::is_past_deadline(&voucher, &batch, now) {
            let expire = Transition::Expire;
            if !tx
                .transition_voucher(voucher.id, expire.sources(), expire.target(), now)
                .await?
            {
                return Err(VoucherError::TransactionConflict(format!(
                    "voucher {} changed while expiring",
                    voucher.id
                )));
            }
            tracing::warn!(
                voucher_id = %voucher.id,
                batch_id = %batch.id,
                deadline = %lifecycle::effective_deadline(&voucher, &batch),
                "Voucher expired on redemption attempt"
            );
            VoucherMetrics::record_expired();
            return Ok(Attempt::Expired);
        }

        if let Some(expected) = voucher.required_password() {
            let supplied = request.voucher_password.as_deref().unwrap_or_default();
            if !constant_time_eq(expected.as_bytes(), supplied.as_bytes()) {
                return Err(self.config.password_mismatch.error());
            }
        }

        if batch.status != BatchStatus::Enabled {
            return Err(VoucherError::BatchDisabled);
        }

        let username = request.username.trim();
        if tx.username_exists(username).await? {
            return Err(VoucherError::UsernameExists {
                username: username.to_string(),
            });
        }

        let expire_time = lifecycle::account_expiration(&voucher, &batch, now);

        let profile = tx
            .get_profile(voucher.profile_id)
            .await?
            .ok_or(VoucherError::ProfileNotFound(voucher.profile_id))?;
        let mut account = tx
            .create_account(&NewAccount::from_profile(&profile, request, expire_time, now))
            .await?;

        let used = Transition::Redeem.check(voucher.status)?;
        if !tx.redeem_voucher(voucher.id, account.id, now).await? {
            tracing::warn!(voucher_id = %voucher.id, "Lost redemption race, retrying");
            return Err(VoucherError::TransactionConflict(format!(
                "voucher {} was redeemed concurrently",
                voucher.id
            )));
        }

        tx.increment_used_count(batch.id, 1).await?;

        account.password.clear();
        let mut voucher = voucher.redacted();
        voucher.status = used;
        voucher.user_id = Some(account.id);
        voucher.redeemed_at = Some(now);
        voucher.updated_at = now;

        Ok(Attempt::Redeemed(Redemption { account, voucher }))
    }
}
