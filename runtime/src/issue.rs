use crate::metrics::VoucherMetrics;
use crate::retry::retry_conflicts;
use crate::{VoucherEngine, finish};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use std::collections::HashSet;
use std::time::Instant;
use voucher_core::code::{CodeFormat, CodeSet};
use voucher_core::{
    Clock, NewBatch, NewVoucher, Result, VoucherBatch, VoucherError, VoucherStore,
    VoucherTransaction,
};

/// Outcome of one issuance attempt.
struct Issued {
    batch: VoucherBatch,
    inserted: u64,
    collisions: usize,
}

impl<S: VoucherStore, C: Clock> VoucherEngine<S, C> {
    /// Issue a batch together with `total_count` unique vouchers.
    ///
    /// The batch row and every voucher are written in one transaction. Codes
    /// are drawn from a secure RNG, checked against storage chunk by chunk
    /// and inserted in chunks of `insert_chunk_size`. Any failure rolls the
    /// whole batch back.
    ///
    /// # Errors
    ///
    /// - [`VoucherError::Validation`] for out-of-range fields
    /// - [`VoucherError::ProfileNotFound`] for an unknown billing profile
    /// - [`VoucherError::BatchNameExists`] for a duplicate live batch name
    /// - [`VoucherError::GenerationExhausted`] if unique codes ran out
    /// - storage errors from the store
    #[tracing::instrument(
        skip(self, request),
        fields(name = %request.name, total_count = request.total_count, code_prefix = %request.prefix)
    )]
    pub async fn issue_batch(&self, request: NewBatch) -> Result<VoucherBatch> {
        let started = Instant::now();
        let request = &request.normalize(self.config.default_code_length)?;

        let result = retry_conflicts(&self.config.conflict_retry, || async move {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let result = self.issue_in(&mut tx, request, now).await;
            finish(tx, result).await
        })
        .await;

        match result {
            Ok(issued) => {
                tracing::info!(
                    batch_id = %issued.batch.id,
                    vouchers = issued.inserted,
                    collisions = issued.collisions,
                    "Voucher batch issued"
                );
                VoucherMetrics::record_issue(issued.inserted, issued.collisions, started.elapsed());
                Ok(issued.batch)
            }
            Err(err) => {
                tracing::warn!(error = %err, code = err.code(), "Voucher batch issuance failed");
                VoucherMetrics::record_issue_failure(&err);
                Err(err)
            }
        }
    }

    async fn issue_in(
        &self,
        tx: &mut S::Tx,
        request: &NewBatch,
        now: DateTime<Utc>,
    ) -> Result<Issued> {
        if tx.get_profile(request.profile_id).await?.is_none() {
            return Err(VoucherError::ProfileNotFound(request.profile_id));
        }
        if tx.find_batch_by_name(&request.name).await?.is_some() {
            return Err(VoucherError::BatchNameExists {
                name: request.name.clone(),
            });
        }

        let batch = tx.insert_batch(request, now).await?;

        let requested = to_usize("total_count", batch.total_count)?;
        let length = to_usize("code_length", batch.code_length)?;
        let mut codes = CodeSet::new(
            CodeFormat::new(&batch.prefix, length),
            requested,
            self.config.code_retry_factor,
        );
        let chunk_size = self.config.insert_chunk_size.max(1);

        loop {
            let added = codes.fill(&mut OsRng)?;
            if added.is_empty() {
                break;
            }

            let mut taken = HashSet::new();
            for chunk in added.chunks(chunk_size) {
                taken.extend(tx.existing_codes(chunk).await?);
            }
            if taken.is_empty() {
                break;
            }

            tracing::debug!(
                batch_id = %batch.id,
                collisions = taken.len(),
                "Generated codes already stored, drawing replacements"
            );
            codes.reject(taken.iter());
        }

        let collisions = codes.collisions();
        let vouchers: Vec<NewVoucher> = codes
            .into_codes()
            .into_iter()
            .map(|code| NewVoucher {
                batch_id: batch.id,
                code,
                password: None,
                profile_id: batch.profile_id,
                expire_time: Some(batch.expire_time),
                created_at: now,
            })
            .collect();

        let mut inserted = 0;
        for chunk in vouchers.chunks(chunk_size) {
            inserted += tx.insert_vouchers(chunk).await?;
        }

        if usize::try_from(inserted).ok() != Some(requested) {
            return Err(VoucherError::Storage(format!(
                "inserted {inserted} of {requested} vouchers"
            )));
        }

        Ok(Issued {
            batch,
            inserted,
            collisions,
        })
    }
}

fn to_usize(field: &'static str, value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| VoucherError::validation(field, "must not be negative"))
}
