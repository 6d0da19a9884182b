//! `PostgreSQL` implementation of [`VoucherStore`].
//!
//! Every engine operation runs inside one `sqlx` transaction at the default
//! `READ COMMITTED` isolation. Exclusion comes from two sources:
//!
//! - `SELECT ... FOR UPDATE` row locks on vouchers and batches, held until
//!   commit or rollback.
//! - Conditional `UPDATE`s whose `WHERE` clause re-checks the expected
//!   status, reporting success through `rows_affected`.
//!
//! A dropped [`PostgresTransaction`] is rolled back by `sqlx` when its
//! connection returns to the pool.

use crate::config::PostgresConfig;
use crate::error::{
    ACCOUNT_USERNAME_KEY, BATCH_NAME_KEY, map_sqlx, storage, unique_violation,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashSet;
use voucher_core::{
    Account, BatchFilter, BatchId, BatchStatus, BatchUpdate, BillingProfile, NewAccount,
    NewBatch, NewVoucher, NodeId, ProfileId, Result, UserId, Voucher, VoucherBatch, VoucherError,
    VoucherId, VoucherStatus, VoucherStore, VoucherTransaction,
};

const BATCH_COLUMNS: &str = "id, node_id, name, profile_id, total_count, used_count, \
     expire_time, valid_days, prefix, code_length, status, remark, \
     created_at, updated_at, deleted_at";

const VOUCHER_COLUMNS: &str = "id, batch_id, code, password, profile_id, status, user_id, \
     redeemed_at, expire_time, remark, created_at, updated_at, deleted_at";

/// `PostgreSQL`-backed voucher store.
///
/// Cheap to clone; clones share the connection pool.
///
/// # Example
///
/// ```no_run
/// use voucher_postgres::{PostgresConfig, PostgresVoucherStore};
///
/// # async fn example() -> voucher_core::Result<()> {
/// let store = PostgresVoucherStore::connect(&PostgresConfig::from_env()).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresVoucherStore {
    pool: PgPool,
}

impl PostgresVoucherStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from the given settings.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Storage`] if the database is unreachable.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = config.connect().await?;
        tracing::info!(max_connections = config.max_connections, "Voucher store connected");
        Ok(Self::new(pool))
    }

    /// Run the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| VoucherError::Storage(format!("Migration failed: {e}")))
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl VoucherStore for PostgresVoucherStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(storage("begin transaction"))?;
        Ok(PostgresTransaction { tx })
    }
}

/// An open `PostgreSQL` transaction.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

impl PostgresTransaction {
    async fn fetch_batch(&mut self, sql: &str, id: BatchId) -> Result<Option<VoucherBatch>> {
        sqlx::query_as::<_, BatchRow>(sql)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("load batch"))?
            .map(VoucherBatch::try_from)
            .transpose()
    }

    async fn fetch_voucher<'q, T>(&mut self, sql: &'q str, key: T) -> Result<Option<Voucher>>
    where
        T: 'q + Send + sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres>,
    {
        sqlx::query_as::<_, VoucherRow>(sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("load voucher"))?
            .map(Voucher::try_from)
            .transpose()
    }
}

impl VoucherTransaction for PostgresTransaction {
    // ═══════════════════════════════════════════════════════════════════════
    // Batches
    // ═══════════════════════════════════════════════════════════════════════

    async fn find_batch_by_name(&mut self, name: &str) -> Result<Option<VoucherBatch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM voucher_batch WHERE name = $1 AND deleted_at IS NULL"
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("find batch by name"))?
            .map(VoucherBatch::try_from)
            .transpose()
    }

    async fn get_batch(&mut self, id: BatchId) -> Result<Option<VoucherBatch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM voucher_batch WHERE id = $1 AND deleted_at IS NULL"
        );
        self.fetch_batch(&sql, id).await
    }

    async fn list_batches(&mut self, filter: &BatchFilter) -> Result<Vec<VoucherBatch>> {
        // strpos keeps `%` and `_` in the filter literal.
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM voucher_batch \
             WHERE deleted_at IS NULL \
               AND ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR strpos(lower(name), lower($2)) > 0) \
             ORDER BY id"
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.name.as_deref())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list batches"))?
            .into_iter()
            .map(VoucherBatch::try_from)
            .collect()
    }

    async fn lock_batch(&mut self, id: BatchId) -> Result<Option<VoucherBatch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM voucher_batch \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        self.fetch_batch(&sql, id).await
    }

    async fn insert_batch(&mut self, batch: &NewBatch, now: DateTime<Utc>) -> Result<VoucherBatch> {
        let sql = format!(
            "INSERT INTO voucher_batch \
                (node_id, name, profile_id, total_count, used_count, expire_time, valid_days, \
                 prefix, code_length, status, remark, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10, $11, $11) \
             RETURNING {BATCH_COLUMNS}"
        );
        let row = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(batch.node_id.0)
            .bind(&batch.name)
            .bind(batch.profile_id.0)
            .bind(batch.total_count)
            .bind(batch.expire_time)
            .bind(batch.valid_days)
            .bind(&batch.prefix)
            .bind(batch.code_length)
            .bind(batch.status.unwrap_or_default().as_str())
            .bind(&batch.remark)
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| batch_write_error("insert batch", &batch.name, e))?;
        row.try_into()
    }

    async fn update_batch(
        &mut self,
        id: BatchId,
        update: &BatchUpdate,
        now: DateTime<Utc>,
    ) -> Result<VoucherBatch> {
        let sql = format!(
            "UPDATE voucher_batch SET \
                name = COALESCE($2, name), \
                node_id = COALESCE($3, node_id), \
                profile_id = COALESCE($4, profile_id), \
                expire_time = COALESCE($5, expire_time), \
                valid_days = COALESCE($6, valid_days), \
                status = COALESCE($7, status), \
                remark = COALESCE($8, remark), \
                updated_at = $9 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {BATCH_COLUMNS}"
        );
        let name = update.name.as_deref().unwrap_or_default();
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(id.0)
            .bind(update.name.as_deref())
            .bind(update.node_id.map(|n| n.0))
            .bind(update.profile_id.map(|p| p.0))
            .bind(update.expire_time)
            .bind(update.valid_days)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.remark.as_deref())
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| batch_write_error("update batch", name, e))?
            .ok_or(VoucherError::BatchNotFound(id))?
            .try_into()
    }

    async fn increment_used_count(&mut self, id: BatchId, delta: i32) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE voucher_batch
            SET used_count = used_count + $2
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id.0)
        .bind(delta)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("increment used count"))?;

        if result.rows_affected() == 0 {
            return Err(VoucherError::Storage(format!("batch {id} not found")));
        }
        Ok(())
    }

    async fn count_used_vouchers(&mut self, id: BatchId) -> Result<i64> {
        let (used,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM voucher
            WHERE batch_id = $1 AND status = 'used' AND deleted_at IS NULL
            ",
        )
        .bind(id.0)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage("count used vouchers"))?;
        Ok(used)
    }

    async fn soft_delete_batch(&mut self, id: BatchId, now: DateTime<Utc>) -> Result<u64> {
        let vouchers = sqlx::query(
            r"
            UPDATE voucher SET deleted_at = $2, updated_at = $2
            WHERE batch_id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id.0)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("delete vouchers"))?;

        let batch = sqlx::query(
            r"
            UPDATE voucher_batch SET deleted_at = $2, updated_at = $2
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id.0)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("delete batch"))?;

        if batch.rows_affected() == 0 {
            return Err(VoucherError::BatchNotFound(id));
        }
        Ok(vouchers.rows_affected())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vouchers
    // ═══════════════════════════════════════════════════════════════════════

    async fn existing_codes(&mut self, codes: &[String]) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT code FROM voucher WHERE code = ANY($1)")
            .bind(codes)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("check existing codes"))?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }

    async fn insert_vouchers(&mut self, vouchers: &[NewVoucher]) -> Result<u64> {
        if vouchers.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO voucher \
             (batch_id, code, password, profile_id, status, expire_time, created_at, updated_at) ",
        );
        builder.push_values(vouchers, |mut row, voucher| {
            row.push_bind(voucher.batch_id.0)
                .push_bind(voucher.code.clone())
                .push_bind(voucher.password.clone())
                .push_bind(voucher.profile_id.0)
                .push_bind(VoucherStatus::Available.as_str())
                .push_bind(voucher.expire_time)
                .push_bind(voucher.created_at)
                .push_bind(voucher.created_at);
        });

        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(storage("insert vouchers"))?;
        Ok(result.rows_affected())
    }

    async fn get_voucher(&mut self, id: VoucherId) -> Result<Option<Voucher>> {
        let sql =
            format!("SELECT {VOUCHER_COLUMNS} FROM voucher WHERE id = $1 AND deleted_at IS NULL");
        self.fetch_voucher(&sql, id.0).await
    }

    async fn lock_voucher(&mut self, id: VoucherId) -> Result<Option<Voucher>> {
        let sql = format!(
            "SELECT {VOUCHER_COLUMNS} FROM voucher \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        self.fetch_voucher(&sql, id.0).await
    }

    async fn lock_voucher_by_code(&mut self, code: &str) -> Result<Option<Voucher>> {
        let sql = format!(
            "SELECT {VOUCHER_COLUMNS} FROM voucher \
             WHERE code = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        self.fetch_voucher(&sql, code.to_string()).await
    }

    async fn list_vouchers(&mut self, batch_id: BatchId) -> Result<Vec<Voucher>> {
        let sql = format!(
            "SELECT {VOUCHER_COLUMNS} FROM voucher \
             WHERE batch_id = $1 AND deleted_at IS NULL ORDER BY id"
        );
        sqlx::query_as::<_, VoucherRow>(&sql)
            .bind(batch_id.0)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage("list vouchers"))?
            .into_iter()
            .map(Voucher::try_from)
            .collect()
    }

    async fn transition_voucher(
        &mut self,
        id: VoucherId,
        from: &[VoucherStatus],
        to: VoucherStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r"
            UPDATE voucher SET status = $2, updated_at = $3
            WHERE id = $1 AND deleted_at IS NULL AND status = ANY($4)
            ",
        )
        .bind(id.0)
        .bind(to.as_str())
        .bind(now)
        .bind(from)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("transition voucher"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn redeem_voucher(
        &mut self,
        id: VoucherId,
        user_id: UserId,
        redeemed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE voucher
            SET status = 'used', user_id = $2, redeemed_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'available' AND deleted_at IS NULL
            ",
        )
        .bind(id.0)
        .bind(user_id.0)
        .bind(redeemed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("redeem voucher"))?;
        Ok(result.rows_affected() == 1)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborators: billing profiles and accounts
    // ═══════════════════════════════════════════════════════════════════════

    async fn get_profile(&mut self, id: ProfileId) -> Result<Option<BillingProfile>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r"
            SELECT id, name, addr_pool, active_num, up_rate, down_rate, domain, bind_mac, bind_vlan
            FROM billing_profile
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage("load billing profile"))?;
        Ok(row.map(BillingProfile::from))
    }

    async fn username_exists(&mut self, username: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM account WHERE username = $1)")
                .bind(username)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(storage("check username"))?;
        Ok(exists)
    }

    async fn create_account(&mut self, account: &NewAccount) -> Result<Account> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO account (
                profile_id, username, password, realname, mobile, email,
                addr_pool, active_num, up_rate, down_rate, domain, bind_mac, bind_vlan,
                status, expire_time, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
            RETURNING id
            ",
        )
        .bind(account.profile_id.0)
        .bind(&account.username)
        .bind(&account.password)
        .bind(&account.realname)
        .bind(&account.mobile)
        .bind(&account.email)
        .bind(&account.addr_pool)
        .bind(account.active_num)
        .bind(account.up_rate)
        .bind(account.down_rate)
        .bind(&account.domain)
        .bind(account.bind_mac)
        .bind(account.bind_vlan)
        .bind(account.status.as_str())
        .bind(account.expire_time)
        .bind(account.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            if unique_violation(&e) == Some(ACCOUNT_USERNAME_KEY) {
                VoucherError::UsernameExists {
                    username: account.username.clone(),
                }
            } else {
                map_sqlx("create account", e)
            }
        })?;

        Ok(account.clone().into_account(UserId(id)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Completion
    // ═══════════════════════════════════════════════════════════════════════

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(storage("commit"))
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(storage("rollback"))
    }
}

fn batch_write_error(context: &str, name: &str, err: sqlx::Error) -> VoucherError {
    if unique_violation(&err) == Some(BATCH_NAME_KEY) {
        VoucherError::BatchNameExists {
            name: name.to_string(),
        }
    } else {
        map_sqlx(context, err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row decoding
// ═══════════════════════════════════════════════════════════════════════════

#[derive(FromRow)]
struct BatchRow {
    id: i64,
    node_id: i64,
    name: String,
    profile_id: i64,
    total_count: i32,
    used_count: i32,
    expire_time: DateTime<Utc>,
    valid_days: i32,
    prefix: String,
    code_length: i32,
    status: String,
    remark: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for VoucherBatch {
    type Error = VoucherError;

    fn try_from(row: BatchRow) -> Result<Self> {
        let status = BatchStatus::parse(&row.status)
            .map_err(|_| VoucherError::Storage(format!("Invalid batch status: {}", row.status)))?;
        Ok(Self {
            id: BatchId(row.id),
            node_id: NodeId(row.node_id),
            name: row.name,
            profile_id: ProfileId(row.profile_id),
            total_count: row.total_count,
            used_count: row.used_count,
            expire_time: row.expire_time,
            valid_days: row.valid_days,
            prefix: row.prefix,
            code_length: row.code_length,
            status,
            remark: row.remark,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(FromRow)]
struct VoucherRow {
    id: i64,
    batch_id: i64,
    code: String,
    password: Option<String>,
    profile_id: i64,
    status: String,
    user_id: Option<i64>,
    redeemed_at: Option<DateTime<Utc>>,
    expire_time: Option<DateTime<Utc>>,
    remark: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<VoucherRow> for Voucher {
    type Error = VoucherError;

    fn try_from(row: VoucherRow) -> Result<Self> {
        let status = VoucherStatus::parse(&row.status)
            .map_err(|_| VoucherError::Storage(format!("Invalid voucher status: {}", row.status)))?;
        Ok(Self {
            id: VoucherId(row.id),
            batch_id: BatchId(row.batch_id),
            code: row.code,
            password: row.password,
            profile_id: ProfileId(row.profile_id),
            status,
            user_id: row.user_id.map(UserId),
            redeemed_at: row.redeemed_at,
            expire_time: row.expire_time,
            remark: row.remark,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(FromRow)]
struct ProfileRow {
    id: i64,
    name: String,
    addr_pool: String,
    active_num: i32,
    up_rate: i32,
    down_rate: i32,
    domain: String,
    bind_mac: bool,
    bind_vlan: bool,
}

impl From<ProfileRow> for BillingProfile {
    fn from(row: ProfileRow) -> Self {
        Self {
            id: ProfileId(row.id),
            name: row.name,
            addr_pool: row.addr_pool,
            active_num: row.active_num,
            up_rate: row.up_rate,
            down_rate: row.down_rate,
            domain: row.domain,
            bind_mac: row.bind_mac,
            bind_vlan: row.bind_vlan,
        }
    }
}
