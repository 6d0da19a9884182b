//! Storage abstraction for batches, vouchers and the account collaborators.
//!
//! The engine never holds in-process locks shared across requests. All
//! mutual exclusion is delegated to the store through two capabilities:
//!
//! - **Row locking**: [`VoucherTransaction::lock_voucher_by_code`] and
//!   friends lock the returned row until the transaction ends.
//! - **Conditional updates**: [`VoucherTransaction::transition_voucher`] and
//!   [`VoucherTransaction::redeem_voucher`] only touch a row still in an
//!   expected status and report whether they did.
//!
//! `used_count` only changes through [`VoucherTransaction::increment_used_count`],
//! which the store evaluates atomically (`used_count = used_count + delta`).
//!
//! # Transactions
//!
//! A transaction that is dropped without [`VoucherTransaction::commit`]
//! rolls back. Cancelling a pending engine future therefore leaves no
//! durable side effects.
//!
//! # Implementations
//!
//! - `PostgresVoucherStore` (in `voucher-postgres`): production
//! - `InMemoryVoucherStore` (in `voucher-testing`): fast, deterministic tests

use crate::error::Result;
use crate::types::{
    Account, BatchFilter, BatchId, BatchUpdate, BillingProfile, NewAccount, NewBatch, ProfileId,
    UserId, Voucher, VoucherBatch, VoucherId, VoucherStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;

/// Voucher row to insert as part of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVoucher {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Upper-cased code.
    pub code: String,
    /// Optional redemption secret.
    pub password: Option<String>,
    /// Inherited billing profile.
    pub profile_id: ProfileId,
    /// Inherited deadline.
    pub expire_time: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Entry point of a transactional voucher store.
pub trait VoucherStore: Send + Sync {
    /// Transaction handle.
    type Tx: VoucherTransaction;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Storage`](crate::VoucherError::Storage) if
    /// no connection is available.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// Operations available inside one store transaction.
///
/// Reads never return soft-deleted rows. Errors are reported as
/// `VoucherError::Storage`, `VoucherError::TransactionConflict` for
/// serialization failures and deadlocks, or the matching conflict variant
/// for unique violations.
pub trait VoucherTransaction: Send {
    // ═══════════════════════════════════════════════════════════════════════
    // Batches
    // ═══════════════════════════════════════════════════════════════════════

    /// Find a live batch by exact name.
    fn find_batch_by_name(
        &mut self,
        name: &str,
    ) -> impl Future<Output = Result<Option<VoucherBatch>>> + Send;

    /// Read a live batch.
    fn get_batch(
        &mut self,
        id: BatchId,
    ) -> impl Future<Output = Result<Option<VoucherBatch>>> + Send;

    /// List live batches passing `filter`, ordered by id.
    fn list_batches(
        &mut self,
        filter: &BatchFilter,
    ) -> impl Future<Output = Result<Vec<VoucherBatch>>> + Send;

    /// Read a live batch and lock its row until the transaction ends.
    fn lock_batch(
        &mut self,
        id: BatchId,
    ) -> impl Future<Output = Result<Option<VoucherBatch>>> + Send;

    /// Insert a batch and return it with its generated id.
    ///
    /// `batch` must already be normalized.
    fn insert_batch(
        &mut self,
        batch: &NewBatch,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<VoucherBatch>> + Send;

    /// Persist an administrative update of a locked batch.
    fn update_batch(
        &mut self,
        id: BatchId,
        update: &BatchUpdate,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<VoucherBatch>> + Send;

    /// Atomically add `delta` to a batch's `used_count`.
    fn increment_used_count(
        &mut self,
        id: BatchId,
        delta: i32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Count `used` vouchers of a batch.
    fn count_used_vouchers(&mut self, id: BatchId) -> impl Future<Output = Result<i64>> + Send;

    /// Soft-delete a batch together with its vouchers.
    ///
    /// Returns the number of vouchers removed.
    fn soft_delete_batch(
        &mut self,
        id: BatchId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;

    // ═══════════════════════════════════════════════════════════════════════
    // Vouchers
    // ═══════════════════════════════════════════════════════════════════════

    /// Return the subset of `codes` that already exist in storage.
    fn existing_codes(
        &mut self,
        codes: &[String],
    ) -> impl Future<Output = Result<HashSet<String>>> + Send;

    /// Insert one chunk of vouchers with status `available`.
    ///
    /// Returns the number of rows inserted.
    fn insert_vouchers(
        &mut self,
        vouchers: &[NewVoucher],
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Read a live voucher.
    fn get_voucher(
        &mut self,
        id: VoucherId,
    ) -> impl Future<Output = Result<Option<Voucher>>> + Send;

    /// Read a live voucher and lock its row until the transaction ends.
    fn lock_voucher(
        &mut self,
        id: VoucherId,
    ) -> impl Future<Output = Result<Option<Voucher>>> + Send;

    /// Find a live voucher by exact (normalized) code and lock its row
    /// until the transaction ends.
    fn lock_voucher_by_code(
        &mut self,
        code: &str,
    ) -> impl Future<Output = Result<Option<Voucher>>> + Send;

    /// List the live vouchers of a batch, ordered by id.
    fn list_vouchers(
        &mut self,
        batch_id: BatchId,
    ) -> impl Future<Output = Result<Vec<Voucher>>> + Send;

    /// Move a voucher to `to` only if its status is one of `from`.
    ///
    /// Returns `false` if no row was changed.
    fn transition_voucher(
        &mut self,
        id: VoucherId,
        from: &[VoucherStatus],
        to: VoucherStatus,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Mark a voucher `used` by `user_id` only if it is still `available`.
    ///
    /// Returns `false` if no row was changed.
    fn redeem_voucher(
        &mut self,
        id: VoucherId,
        user_id: UserId,
        redeemed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborators: billing profiles and accounts
    // ═══════════════════════════════════════════════════════════════════════

    /// Look up a billing profile.
    fn get_profile(
        &mut self,
        id: ProfileId,
    ) -> impl Future<Output = Result<Option<BillingProfile>>> + Send;

    /// Returns `true` if an active account already uses `username`.
    fn username_exists(&mut self, username: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Create an account.
    ///
    /// A concurrent insert of the same username surfaces as
    /// `VoucherError::UsernameExists`.
    fn create_account(
        &mut self,
        account: &NewAccount,
    ) -> impl Future<Output = Result<Account>> + Send;

    // ═══════════════════════════════════════════════════════════════════════
    // Completion
    // ═══════════════════════════════════════════════════════════════════════

    /// Make every write of this transaction durable.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard every write of this transaction.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
