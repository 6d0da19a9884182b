//! In-memory [`VoucherStore`] for fast, deterministic engine tests.
//!
//! Behaves like a row-locking SQL store at `READ COMMITTED`:
//!
//! - Reads observe committed rows only.
//! - `lock_*` methods take a per-row async lock held until the
//!   transaction ends, so a second locker waits and then reads the
//!   committed result of the first.
//! - Writes are staged and applied atomically at commit, re-checking
//!   unique codes, batch names, usernames and conditional statuses.
//!   A failed check aborts the commit and nothing is applied.
//! - Dropping a transaction discards its staged writes.
//!
//! Failures can be injected at named points to exercise rollback paths.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use voucher_core::{
    Account, AccountStatus, BatchFilter, BatchId, BatchUpdate, BillingProfile, NewAccount,
    NewBatch, NewVoucher, ProfileId, Result, UserId, Voucher, VoucherBatch, VoucherError,
    VoucherId, VoucherStatus, VoucherStore, VoucherTransaction,
};

/// Store operation at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Opening a transaction.
    Begin,
    /// Inserting a batch row.
    InsertBatch,
    /// Inserting a chunk of vouchers.
    InsertVouchers,
    /// Creating an account.
    CreateAccount,
    /// The conditional redeem update.
    RedeemVoucher,
    /// The `used_count` increment.
    IncrementUsedCount,
    /// Soft-deleting a batch.
    SoftDeleteBatch,
    /// Committing.
    Commit,
}

/// Codes that [`VoucherTransaction::existing_codes`] reports as taken
/// on top of the stored ones.
#[derive(Debug, Clone, Copy, Default)]
enum ForcedCollisions {
    #[default]
    None,
    /// The next `n` free codes looked up.
    Next(usize),
    /// Every code looked up.
    All,
}

#[derive(Debug, Clone)]
enum Injection {
    Always(VoucherError),
    Once(VoucherError),
}

#[derive(Debug, Clone)]
enum Write {
    InsertBatch(VoucherBatch),
    UpdateBatch(BatchId, BatchUpdate, DateTime<Utc>),
    IncrementUsed(BatchId, i32),
    SoftDeleteBatch(BatchId, DateTime<Utc>),
    InsertVouchers(Vec<Voucher>),
    Transition {
        id: VoucherId,
        from: Vec<VoucherStatus>,
        to: VoucherStatus,
        at: DateTime<Utc>,
    },
    Redeem {
        id: VoucherId,
        user_id: UserId,
        at: DateTime<Utc>,
    },
    CreateAccount(Account),
}

#[derive(Debug, Clone, Default)]
struct State {
    batches: BTreeMap<BatchId, VoucherBatch>,
    vouchers: BTreeMap<VoucherId, Voucher>,
    codes: HashMap<String, VoucherId>,
    profiles: HashMap<ProfileId, BillingProfile>,
    accounts: BTreeMap<UserId, Account>,
}

impl State {
    fn live_batch(&self, id: BatchId) -> Option<&VoucherBatch> {
        self.batches.get(&id).filter(|b| b.deleted_at.is_none())
    }

    fn live_voucher(&self, id: VoucherId) -> Option<&Voucher> {
        self.vouchers.get(&id).filter(|v| v.deleted_at.is_none())
    }

    fn live_vouchers_of(&self, batch_id: BatchId) -> impl Iterator<Item = &Voucher> {
        self.vouchers
            .values()
            .filter(move |v| v.batch_id == batch_id && v.deleted_at.is_none())
    }

    fn name_taken(&self, name: &str, except: Option<BatchId>) -> bool {
        self.batches
            .values()
            .any(|b| b.deleted_at.is_none() && b.name == name && Some(b.id) != except)
    }

    fn apply(&mut self, write: Write) -> Result<()> {
        match write {
            Write::InsertBatch(batch) => {
                if self.name_taken(&batch.name, None) {
                    return Err(VoucherError::BatchNameExists { name: batch.name });
                }
                self.batches.insert(batch.id, batch);
            }
            Write::UpdateBatch(id, update, at) => {
                if let Some(name) = &update.name {
                    if self.name_taken(name, Some(id)) {
                        return Err(VoucherError::BatchNameExists { name: name.clone() });
                    }
                }
                let batch = self.live_batch_mut(id)?;
                update.apply(batch, at);
            }
            Write::IncrementUsed(id, delta) => {
                let batch = self.live_batch_mut(id)?;
                batch.used_count += delta;
            }
            Write::SoftDeleteBatch(id, at) => {
                if self
                    .live_vouchers_of(id)
                    .any(|v| v.status == VoucherStatus::Used)
                {
                    return Err(VoucherError::TransactionConflict(format!(
                        "batch {id} gained used vouchers"
                    )));
                }
                self.live_batch_mut(id)?.deleted_at = Some(at);
                for voucher in self.vouchers.values_mut() {
                    if voucher.batch_id == id && voucher.deleted_at.is_none() {
                        voucher.deleted_at = Some(at);
                    }
                }
            }
            Write::InsertVouchers(vouchers) => {
                for voucher in vouchers {
                    if self.live_batch(voucher.batch_id).is_none() {
                        return Err(VoucherError::Storage(format!(
                            "voucher references missing batch {}",
                            voucher.batch_id
                        )));
                    }
                    if self.codes.contains_key(&voucher.code) {
                        return Err(VoucherError::TransactionConflict(
                            "duplicate voucher code".to_string(),
                        ));
                    }
                    self.codes.insert(voucher.code.clone(), voucher.id);
                    self.vouchers.insert(voucher.id, voucher);
                }
            }
            Write::Transition { id, from, to, at } => {
                let voucher = self.live_voucher_mut(id)?;
                if !from.contains(&voucher.status) {
                    return Err(VoucherError::TransactionConflict(format!(
                        "voucher {id} is {}",
                        voucher.status
                    )));
                }
                voucher.status = to;
                voucher.updated_at = at;
            }
            Write::Redeem { id, user_id, at } => {
                let voucher = self.live_voucher_mut(id)?;
                if voucher.status != VoucherStatus::Available {
                    return Err(VoucherError::TransactionConflict(format!(
                        "voucher {id} is {}",
                        voucher.status
                    )));
                }
                voucher.status = VoucherStatus::Used;
                voucher.user_id = Some(user_id);
                voucher.redeemed_at = Some(at);
                voucher.updated_at = at;
            }
            Write::CreateAccount(account) => {
                if self.accounts.values().any(|a| a.username == account.username) {
                    return Err(VoucherError::UsernameExists {
                        username: account.username,
                    });
                }
                self.accounts.insert(account.id, account);
            }
        }
        Ok(())
    }

    fn live_batch_mut(&mut self, id: BatchId) -> Result<&mut VoucherBatch> {
        self.batches
            .get_mut(&id)
            .filter(|b| b.deleted_at.is_none())
            .ok_or_else(|| VoucherError::TransactionConflict(format!("batch {id} was removed")))
    }

    fn live_voucher_mut(&mut self, id: VoucherId) -> Result<&mut Voucher> {
        self.vouchers
            .get_mut(&id)
            .filter(|v| v.deleted_at.is_none())
            .ok_or_else(|| VoucherError::TransactionConflict(format!("voucher {id} was removed")))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    voucher_locks: Mutex<HashMap<VoucherId, Arc<RowLock<()>>>>,
    batch_locks: Mutex<HashMap<BatchId, Arc<RowLock<()>>>>,
    failures: Mutex<HashMap<FailPoint, Injection>>,
    forced_collisions: Mutex<ForcedCollisions>,
    reported_collisions: Mutex<Vec<String>>,
    next_id: AtomicI64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        let mut failures = lock(&self.failures);
        match failures.remove(&point) {
            None => Ok(()),
            Some(Injection::Once(err)) => Err(err),
            Some(Injection::Always(err)) => {
                failures.insert(point, Injection::Always(err.clone()));
                Err(err)
            }
        }
    }
}

/// In-memory voucher store.
///
/// Cloning shares the underlying data, so a test can keep a handle for
/// inspection after moving one into the engine.
///
/// # Example
///
/// ```
/// use voucher_testing::{InMemoryVoucherStore, fixtures};
///
/// let store = InMemoryVoucherStore::new();
/// let profile_id = store.insert_profile(fixtures::profile(1));
/// assert_eq!(profile_id.0, 1);
/// assert_eq!(store.voucher_count(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryVoucherStore {
    shared: Arc<Shared>,
}

impl InMemoryVoucherStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Seeding
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace a billing profile.
    pub fn insert_profile(&self, profile: BillingProfile) -> ProfileId {
        let id = profile.id;
        lock(&self.shared.state).profiles.insert(id, profile);
        id
    }

    /// Create an account directly, bypassing redemption.
    pub fn insert_account(
        &self,
        username: &str,
        profile_id: ProfileId,
        now: DateTime<Utc>,
    ) -> UserId {
        let id = UserId(self.shared.next_id());
        let account = Account {
            id,
            profile_id,
            username: username.to_string(),
            password: String::new(),
            realname: String::new(),
            mobile: String::new(),
            email: String::new(),
            addr_pool: String::new(),
            active_num: 1,
            up_rate: 0,
            down_rate: 0,
            domain: String::new(),
            bind_mac: false,
            bind_vlan: false,
            status: AccountStatus::Enabled,
            expire_time: now,
            created_at: now,
            updated_at: now,
        };
        lock(&self.shared.state).accounts.insert(id, account);
        id
    }

    /// Set or clear a voucher's redemption password.
    pub fn set_voucher_password(&self, id: VoucherId, password: Option<&str>) {
        if let Some(voucher) = lock(&self.shared.state).vouchers.get_mut(&id) {
            voucher.password = password.map(str::to_string);
        }
    }

    /// Set or clear a voucher's own deadline.
    pub fn set_voucher_expire_time(&self, id: VoucherId, expire_time: Option<DateTime<Utc>>) {
        if let Some(voucher) = lock(&self.shared.state).vouchers.get_mut(&id) {
            voucher.expire_time = expire_time;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    /// Committed batch row, including soft-deleted ones.
    #[must_use]
    pub fn batch(&self, id: BatchId) -> Option<VoucherBatch> {
        lock(&self.shared.state).batches.get(&id).cloned()
    }

    /// Committed voucher row, including soft-deleted ones.
    #[must_use]
    pub fn voucher(&self, id: VoucherId) -> Option<Voucher> {
        lock(&self.shared.state).vouchers.get(&id).cloned()
    }

    /// Committed voucher with the given code.
    #[must_use]
    pub fn voucher_by_code(&self, code: &str) -> Option<Voucher> {
        let state = lock(&self.shared.state);
        state.codes.get(code).and_then(|id| state.vouchers.get(id)).cloned()
    }

    /// All committed vouchers of a batch, including soft-deleted ones.
    #[must_use]
    pub fn vouchers_of(&self, batch_id: BatchId) -> Vec<Voucher> {
        lock(&self.shared.state)
            .vouchers
            .values()
            .filter(|v| v.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// All committed accounts.
    #[must_use]
    pub fn accounts(&self) -> Vec<Account> {
        lock(&self.shared.state).accounts.values().cloned().collect()
    }

    /// Number of committed batches, including soft-deleted ones.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        lock(&self.shared.state).batches.len()
    }

    /// Number of committed vouchers, including soft-deleted ones.
    #[must_use]
    pub fn voucher_count(&self) -> usize {
        lock(&self.shared.state).vouchers.len()
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of explicitly rolled back transactions.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Failure injection
    // ═══════════════════════════════════════════════════════════════════════

    /// Fail every call at `point` with a storage error.
    pub fn fail_on(&self, point: FailPoint) {
        lock(&self.shared.failures).insert(
            point,
            Injection::Always(VoucherError::Storage(format!("injected failure at {point:?}"))),
        );
    }

    /// Fail the next call at `point` with `error`.
    pub fn fail_once(&self, point: FailPoint, error: VoucherError) {
        lock(&self.shared.failures).insert(point, Injection::Once(error));
    }

    /// Remove all injected failures and forced collisions.
    pub fn clear_failures(&self) {
        lock(&self.shared.failures).clear();
        *lock(&self.shared.forced_collisions) = ForcedCollisions::None;
    }

    /// Report the next `n` free codes looked up as already taken.
    pub fn collide_next(&self, n: usize) {
        *lock(&self.shared.forced_collisions) = ForcedCollisions::Next(n);
    }

    /// Report every code looked up as already taken.
    pub fn collide_all(&self) {
        *lock(&self.shared.forced_collisions) = ForcedCollisions::All;
    }

    /// Free codes that were reported as taken by a forced collision.
    #[must_use]
    pub fn reported_collisions(&self) -> Vec<String> {
        lock(&self.shared.reported_collisions).clone()
    }
}

impl VoucherStore for InMemoryVoucherStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        self.shared.check(FailPoint::Begin)?;
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            writes: Vec::new(),
            voucher_guards: HashMap::new(),
            batch_guards: HashMap::new(),
        })
    }
}

/// Transaction of an [`InMemoryVoucherStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    writes: Vec<Write>,
    voucher_guards: HashMap<VoucherId, OwnedMutexGuard<()>>,
    batch_guards: HashMap<BatchId, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared.state)
    }

    async fn acquire_voucher(&mut self, id: VoucherId) {
        if self.voucher_guards.contains_key(&id) {
            return;
        }
        let row = Arc::clone(lock(&self.shared.voucher_locks).entry(id).or_default());
        let guard = row.lock_owned().await;
        self.voucher_guards.insert(id, guard);
    }

    async fn acquire_batch(&mut self, id: BatchId) {
        if self.batch_guards.contains_key(&id) {
            return;
        }
        let row = Arc::clone(lock(&self.shared.batch_locks).entry(id).or_default());
        let guard = row.lock_owned().await;
        self.batch_guards.insert(id, guard);
    }
}

impl VoucherTransaction for InMemoryTransaction {
    async fn find_batch_by_name(&mut self, name: &str) -> Result<Option<VoucherBatch>> {
        Ok(self
            .state()
            .batches
            .values()
            .find(|b| b.deleted_at.is_none() && b.name == name)
            .cloned())
    }

    async fn get_batch(&mut self, id: BatchId) -> Result<Option<VoucherBatch>> {
        Ok(self.state().live_batch(id).cloned())
    }

    async fn list_batches(&mut self, filter: &BatchFilter) -> Result<Vec<VoucherBatch>> {
        Ok(self
            .state()
            .batches
            .values()
            .filter(|b| b.deleted_at.is_none() && filter.matches(b))
            .cloned()
            .collect())
    }

    async fn lock_batch(&mut self, id: BatchId) -> Result<Option<VoucherBatch>> {
        if self.state().live_batch(id).is_none() {
            return Ok(None);
        }
        self.acquire_batch(id).await;
        Ok(self.state().live_batch(id).cloned())
    }

    async fn insert_batch(&mut self, batch: &NewBatch, now: DateTime<Utc>) -> Result<VoucherBatch> {
        self.shared.check(FailPoint::InsertBatch)?;
        let row = VoucherBatch {
            id: BatchId(self.shared.next_id()),
            node_id: batch.node_id,
            name: batch.name.clone(),
            profile_id: batch.profile_id,
            total_count: batch.total_count,
            used_count: 0,
            expire_time: batch.expire_time,
            valid_days: batch.valid_days,
            prefix: batch.prefix.clone(),
            code_length: batch.code_length,
            status: batch.status.unwrap_or_default(),
            remark: batch.remark.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.writes.push(Write::InsertBatch(row.clone()));
        Ok(row)
    }

    async fn update_batch(
        &mut self,
        id: BatchId,
        update: &BatchUpdate,
        now: DateTime<Utc>,
    ) -> Result<VoucherBatch> {
        let mut batch = self
            .state()
            .live_batch(id)
            .cloned()
            .ok_or(VoucherError::BatchNotFound(id))?;
        update.apply(&mut batch, now);
        self.writes.push(Write::UpdateBatch(id, update.clone(), now));
        Ok(batch)
    }

    async fn increment_used_count(&mut self, id: BatchId, delta: i32) -> Result<()> {
        self.shared.check(FailPoint::IncrementUsedCount)?;
        if self.state().live_batch(id).is_none() {
            return Err(VoucherError::Storage(format!("batch {id} not found")));
        }
        self.writes.push(Write::IncrementUsed(id, delta));
        Ok(())
    }

    async fn count_used_vouchers(&mut self, id: BatchId) -> Result<i64> {
        let used = self
            .state()
            .live_vouchers_of(id)
            .filter(|v| v.status == VoucherStatus::Used)
            .count();
        Ok(i64::try_from(used).unwrap_or(i64::MAX))
    }

    async fn soft_delete_batch(&mut self, id: BatchId, now: DateTime<Utc>) -> Result<u64> {
        self.shared.check(FailPoint::SoftDeleteBatch)?;
        let removed = self.state().live_vouchers_of(id).count();
        self.writes.push(Write::SoftDeleteBatch(id, now));
        Ok(removed as u64)
    }

    async fn existing_codes(&mut self, codes: &[String]) -> Result<HashSet<String>> {
        let mut taken: HashSet<String> = {
            let state = self.state();
            codes
                .iter()
                .filter(|c| state.codes.contains_key(*c))
                .cloned()
                .collect()
        };

        let mut forced = lock(&self.shared.forced_collisions);
        let budget = match *forced {
            ForcedCollisions::None => 0,
            ForcedCollisions::Next(n) => n,
            ForcedCollisions::All => usize::MAX,
        };
        let extra: Vec<String> = codes
            .iter()
            .filter(|c| !taken.contains(*c))
            .take(budget)
            .cloned()
            .collect();
        if let ForcedCollisions::Next(n) = *forced {
            *forced = ForcedCollisions::Next(n - extra.len());
        }
        drop(forced);

        lock(&self.shared.reported_collisions).extend(extra.iter().cloned());
        taken.extend(extra);
        Ok(taken)
    }

    async fn insert_vouchers(&mut self, vouchers: &[NewVoucher]) -> Result<u64> {
        self.shared.check(FailPoint::InsertVouchers)?;
        let rows: Vec<Voucher> = vouchers
            .iter()
            .map(|v| Voucher {
                id: VoucherId(self.shared.next_id()),
                batch_id: v.batch_id,
                code: v.code.clone(),
                password: v.password.clone(),
                profile_id: v.profile_id,
                status: VoucherStatus::Available,
                user_id: None,
                redeemed_at: None,
                expire_time: v.expire_time,
                remark: String::new(),
                created_at: v.created_at,
                updated_at: v.created_at,
                deleted_at: None,
            })
            .collect();
        let inserted = rows.len() as u64;
        self.writes.push(Write::InsertVouchers(rows));
        Ok(inserted)
    }

    async fn get_voucher(&mut self, id: VoucherId) -> Result<Option<Voucher>> {
        Ok(self.state().live_voucher(id).cloned())
    }

    async fn lock_voucher(&mut self, id: VoucherId) -> Result<Option<Voucher>> {
        if self.state().live_voucher(id).is_none() {
            return Ok(None);
        }
        self.acquire_voucher(id).await;
        Ok(self.state().live_voucher(id).cloned())
    }

    async fn lock_voucher_by_code(&mut self, code: &str) -> Result<Option<Voucher>> {
        let id = self.state().codes.get(code).copied();
        match id {
            Some(id) => self.lock_voucher(id).await,
            None => Ok(None),
        }
    }

    async fn list_vouchers(&mut self, batch_id: BatchId) -> Result<Vec<Voucher>> {
        Ok(self.state().live_vouchers_of(batch_id).cloned().collect())
    }

    async fn transition_voucher(
        &mut self,
        id: VoucherId,
        from: &[VoucherStatus],
        to: VoucherStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let matches = self
            .state()
            .live_voucher(id)
            .is_some_and(|v| from.contains(&v.status));
        if matches {
            self.writes.push(Write::Transition {
                id,
                from: from.to_vec(),
                to,
                at: now,
            });
        }
        Ok(matches)
    }

    async fn redeem_voucher(
        &mut self,
        id: VoucherId,
        user_id: UserId,
        redeemed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.shared.check(FailPoint::RedeemVoucher)?;
        let available = self
            .state()
            .live_voucher(id)
            .is_some_and(|v| v.status == VoucherStatus::Available);
        if available {
            self.writes.push(Write::Redeem {
                id,
                user_id,
                at: redeemed_at,
            });
        }
        Ok(available)
    }

    async fn get_profile(&mut self, id: ProfileId) -> Result<Option<BillingProfile>> {
        Ok(self.state().profiles.get(&id).cloned())
    }

    async fn username_exists(&mut self, username: &str) -> Result<bool> {
        Ok(self
            .state()
            .accounts
            .values()
            .any(|a| a.username == username))
    }

    async fn create_account(&mut self, account: &NewAccount) -> Result<Account> {
        self.shared.check(FailPoint::CreateAccount)?;
        let account = account.clone().into_account(UserId(self.shared.next_id()));
        self.writes.push(Write::CreateAccount(account.clone()));
        Ok(account)
    }

    async fn commit(mut self) -> Result<()> {
        self.shared.check(FailPoint::Commit)?;
        let writes = std::mem::take(&mut self.writes);
        {
            let mut state = self.state();
            let mut next = state.clone();
            for write in writes {
                next.apply(write)?;
            }
            *state = next;
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
