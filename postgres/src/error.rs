//! Mapping of `sqlx` failures onto [`VoucherError`].

use voucher_core::VoucherError;

/// Unique index on live batch names.
pub(crate) const BATCH_NAME_KEY: &str = "voucher_batch_name_key";

/// Unique constraint on voucher codes.
pub(crate) const VOUCHER_CODE_KEY: &str = "voucher_code_key";

/// Unique constraint on account usernames.
pub(crate) const ACCOUNT_USERNAME_KEY: &str = "account_username_key";

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Name of the unique constraint a database error violated, if any.
pub(crate) fn unique_violation(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => db.constraint(),
        _ => None,
    }
}

/// Convert a `sqlx` error into a voucher error.
///
/// Serialization failures, deadlocks and duplicate voucher codes abort the
/// whole transaction and become [`VoucherError::TransactionConflict`], which
/// the engine retries. Everything else is a [`VoucherError::Storage`].
pub(crate) fn map_sqlx(context: &str, err: sqlx::Error) -> VoucherError {
    if let sqlx::Error::Database(db) = &err {
        let code = db.code();
        match code.as_deref() {
            Some(sqlstate @ (SERIALIZATION_FAILURE | DEADLOCK_DETECTED)) => {
                tracing::warn!(sqlstate, context, "Transaction aborted by the database");
                metrics::counter!("voucher_store_conflicts_total", "sqlstate" => sqlstate.to_string())
                    .increment(1);
                return VoucherError::TransactionConflict(format!("{context}: {db}"));
            }
            _ => {}
        }
        if db.is_unique_violation() && db.constraint() == Some(VOUCHER_CODE_KEY) {
            metrics::counter!("voucher_store_conflicts_total", "sqlstate" => "23505").increment(1);
            return VoucherError::TransactionConflict(format!("{context}: duplicate voucher code"));
        }
    }

    tracing::error!(error = %err, context, "Database operation failed");
    VoucherError::Storage(format!("{context}: {err}"))
}

/// Closure form of [`map_sqlx`] for `map_err`.
pub(crate) fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> VoucherError {
    move |err| map_sqlx(context, err)
}
