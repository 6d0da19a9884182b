use crate::metrics::VoucherMetrics;
use crate::retry::retry_conflicts;
use crate::{VoucherEngine, finish};
use chrono::{DateTime, Utc};
use voucher_core::lifecycle::Transition;
use voucher_core::{
    BatchFilter, BatchId, BatchUpdate, Clock, Result, Voucher, VoucherBatch, VoucherError,
    VoucherId, VoucherStore, VoucherTransaction,
};

impl<S: VoucherStore, C: Clock> VoucherEngine<S, C> {
    // ═══════════════════════════════════════════════════════════════════════
    // Vouchers
    // ═══════════════════════════════════════════════════════════════════════

    /// Withdraw an `available` or `expired` voucher.
    ///
    /// # Errors
    ///
    /// - [`VoucherError::VoucherIdNotFound`] for an unknown voucher
    /// - [`VoucherError::IllegalTransition`] if the voucher is `used` or
    ///   already `disabled`
    #[tracing::instrument(skip(self))]
    pub async fn disable_voucher(&self, id: VoucherId) -> Result<Voucher> {
        let voucher = retry_conflicts(&self.config.conflict_retry, || async move {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let result = Self::disable_in(&mut tx, id, now).await;
            finish(tx, result).await
        })
        .await?;

        tracing::info!(voucher_id = %id, batch_id = %voucher.batch_id, "Voucher disabled");
        VoucherMetrics::record_disabled();
        Ok(voucher)
    }

    async fn disable_in(tx: &mut S::Tx, id: VoucherId, now: DateTime<Utc>) -> Result<Voucher> {
        let voucher = tx
            .lock_voucher(id)
            .await?
            .ok_or(VoucherError::VoucherIdNotFound(id))?;

        let disable = Transition::Disable;
        let target = disable.check(voucher.status)?;
        if !tx
            .transition_voucher(id, disable.sources(), target, now)
            .await?
        {
            return Err(VoucherError::TransactionConflict(format!(
                "voucher {id} changed while disabling"
            )));
        }

        let mut voucher = voucher.redacted();
        voucher.status = target;
        voucher.updated_at = now;
        Ok(voucher)
    }

    /// Read a live voucher. The password is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::VoucherIdNotFound`] for an unknown voucher.
    pub async fn get_voucher(&self, id: VoucherId) -> Result<Voucher> {
        let mut tx = self.store.begin().await?;
        let result = tx
            .get_voucher(id)
            .await
            .and_then(|v| v.ok_or(VoucherError::VoucherIdNotFound(id)));
        finish(tx, result).await.map(Voucher::redacted)
    }

    /// List the live vouchers of a batch, ordered by id. Passwords are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::BatchNotFound`] for an unknown batch.
    pub async fn list_vouchers(&self, batch_id: BatchId) -> Result<Vec<Voucher>> {
        let mut tx = self.store.begin().await?;
        let result = match tx.get_batch(batch_id).await {
            Ok(Some(_)) => tx.list_vouchers(batch_id).await,
            Ok(None) => Err(VoucherError::BatchNotFound(batch_id)),
            Err(err) => Err(err),
        };
        let vouchers = finish(tx, result).await?;
        Ok(vouchers.into_iter().map(Voucher::redacted).collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batches
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a live batch.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::BatchNotFound`] for an unknown batch.
    pub async fn get_batch(&self, id: BatchId) -> Result<VoucherBatch> {
        let mut tx = self.store.begin().await?;
        let result = tx
            .get_batch(id)
            .await
            .and_then(|b| b.ok_or(VoucherError::BatchNotFound(id)));
        finish(tx, result).await
    }

    /// List live batches passing `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Storage`] if the store fails.
    pub async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<VoucherBatch>> {
        let filter = filter.normalize();
        let mut tx = self.store.begin().await?;
        let result = tx.list_batches(&filter).await;
        finish(tx, result).await
    }

    /// Apply an administrative update to a batch.
    ///
    /// Existing vouchers keep their codes, profile and deadline. An empty
    /// update returns the batch unchanged.
    ///
    /// # Errors
    ///
    /// - [`VoucherError::Validation`] for out-of-range fields
    /// - [`VoucherError::BatchNotFound`] for an unknown batch
    /// - [`VoucherError::BatchNameExists`] if another batch has the name
    /// - [`VoucherError::ProfileNotFound`] for an unknown profile
    #[tracing::instrument(skip(self, update))]
    pub async fn update_batch(&self, id: BatchId, update: BatchUpdate) -> Result<VoucherBatch> {
        let update = update.normalize()?;
        if update.is_empty() {
            return self.get_batch(id).await;
        }

        let update = &update;
        let batch = retry_conflicts(&self.config.conflict_retry, || async move {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let result = Self::update_in(&mut tx, id, update, now).await;
            finish(tx, result).await
        })
        .await?;

        tracing::info!(batch_id = %id, status = %batch.status, "Voucher batch updated");
        Ok(batch)
    }

    async fn update_in(
        tx: &mut S::Tx,
        id: BatchId,
        update: &BatchUpdate,
        now: DateTime<Utc>,
    ) -> Result<VoucherBatch> {
        let current = tx
            .lock_batch(id)
            .await?
            .ok_or(VoucherError::BatchNotFound(id))?;

        if let Some(name) = update.name.as_deref().filter(|n| *n != current.name) {
            if tx.find_batch_by_name(name).await?.is_some_and(|b| b.id != id) {
                return Err(VoucherError::BatchNameExists {
                    name: name.to_string(),
                });
            }
        }
        if let Some(profile_id) = update.profile_id {
            if tx.get_profile(profile_id).await?.is_none() {
                return Err(VoucherError::ProfileNotFound(profile_id));
            }
        }

        tx.update_batch(id, update, now).await
    }

    /// Soft-delete a batch together with its vouchers.
    ///
    /// # Errors
    ///
    /// - [`VoucherError::BatchNotFound`] for an unknown batch
    /// - [`VoucherError::BatchInUse`] if any voucher of the batch is `used`
    #[tracing::instrument(skip(self))]
    pub async fn delete_batch(&self, id: BatchId) -> Result<()> {
        let removed = retry_conflicts(&self.config.conflict_retry, || async move {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let result = Self::delete_in(&mut tx, id, now).await;
            finish(tx, result).await
        })
        .await?;

        tracing::info!(batch_id = %id, vouchers = removed, "Voucher batch deleted");
        VoucherMetrics::record_batch_deleted();
        Ok(())
    }

    async fn delete_in(tx: &mut S::Tx, id: BatchId, now: DateTime<Utc>) -> Result<u64> {
        tx.lock_batch(id)
            .await?
            .ok_or(VoucherError::BatchNotFound(id))?;

        let used = tx.count_used_vouchers(id).await?;
        if used > 0 {
            return Err(VoucherError::BatchInUse { used });
        }

        tx.soft_delete_batch(id, now).await
    }
}
