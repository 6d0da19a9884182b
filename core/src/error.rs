//! Error types for voucher issuance, redemption and administration.

use crate::types::{BatchId, ProfileId, VoucherId, VoucherStatus};
use thiserror::Error;

/// Result type alias for voucher operations.
pub type Result<T> = std::result::Result<T, VoucherError>;

/// Broad category of a [`VoucherError`].
///
/// Every error variant belongs to exactly one category. Callers that only
/// need coarse handling (for example choosing an HTTP status) can match on
/// the kind instead of the individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-range input.
    Validation,
    /// A referenced batch, profile or voucher does not exist.
    NotFound,
    /// Uniqueness or ownership conflict.
    Conflict,
    /// The voucher or batch is in a state that forbids the operation.
    State,
    /// Voucher password mismatch.
    Auth,
    /// Code generation ran out of attempts.
    Generation,
    /// Transaction, commit or constraint failure surfaced by the store.
    Storage,
}

impl ErrorKind {
    /// Stable lowercase name of the category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::State => "state",
            Self::Auth => "auth",
            Self::Generation => "generation",
            Self::Storage => "storage",
        }
    }
}

/// Error taxonomy for the voucher lifecycle engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoucherError {
    // ═══════════════════════════════════════════════════════════
    // Validation Errors
    // ═══════════════════════════════════════════════════════════

    /// An input field is malformed or out of range.
    #[error("Invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Not Found
    // ═══════════════════════════════════════════════════════════

    /// No voucher matches the supplied code.
    #[error("Invalid voucher code")]
    VoucherNotFound,

    /// No voucher with this id.
    #[error("Voucher {0} not found")]
    VoucherIdNotFound(VoucherId),

    /// No live batch with this id.
    #[error("Voucher batch {0} not found")]
    BatchNotFound(BatchId),

    /// The referenced billing profile does not exist.
    #[error("Billing profile {0} not found")]
    ProfileNotFound(ProfileId),

    // ═══════════════════════════════════════════════════════════
    // Conflicts
    // ═══════════════════════════════════════════════════════════

    /// Another non-deleted batch already uses this name.
    #[error("Batch name already exists: {name}")]
    BatchNameExists {
        /// The duplicate name
        name: String,
    },

    /// An active account already uses this username.
    #[error("Username already exists: {username}")]
    UsernameExists {
        /// The duplicate username
        username: String,
    },

    /// The batch owns redeemed vouchers and cannot be deleted.
    #[error("Cannot delete batch with {used} used vouchers")]
    BatchInUse {
        /// Number of used vouchers in the batch
        used: i64,
    },

    // ═══════════════════════════════════════════════════════════
    // State Errors
    // ═══════════════════════════════════════════════════════════

    /// The voucher is not in the `available` state.
    #[error("Voucher is not available for redemption (status: {status})")]
    VoucherNotAvailable {
        /// Current status of the voucher
        status: VoucherStatus,
    },

    /// The voucher's deadline has passed.
    #[error("Voucher has expired")]
    VoucherExpired,

    /// The owning batch is disabled.
    #[error("Voucher batch is disabled")]
    BatchDisabled,

    /// The requested lifecycle transition is not allowed.
    #[error("Illegal voucher transition from {from} to {to}")]
    IllegalTransition {
        /// Current status
        from: VoucherStatus,
        /// Requested status
        to: VoucherStatus,
    },

    // ═══════════════════════════════════════════════════════════
    // Auth
    // ═══════════════════════════════════════════════════════════

    /// The supplied voucher password does not match.
    #[error("Invalid voucher password")]
    InvalidVoucherPassword,

    // ═══════════════════════════════════════════════════════════
    // Generation
    // ═══════════════════════════════════════════════════════════

    /// Unique code generation ran out of attempts.
    #[error("Voucher code generation exhausted after {attempts} attempts ({generated}/{requested} codes)")]
    GenerationExhausted {
        /// Attempts made
        attempts: usize,
        /// Codes successfully generated
        generated: usize,
        /// Codes requested
        requested: usize,
    },

    // ═══════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════

    /// Serialization failure, deadlock or lost conditional update.
    ///
    /// Safe to retry the whole transaction.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Any other storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl VoucherError {
    /// Build a [`VoucherError::Validation`].
    #[must_use]
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Category of this error.
    ///
    /// # Examples
    ///
    /// ```
    /// # use voucher_core::{ErrorKind, VoucherError};
    /// assert_eq!(VoucherError::VoucherExpired.kind(), ErrorKind::State);
    /// assert_eq!(VoucherError::InvalidVoucherPassword.kind(), ErrorKind::Auth);
    /// ```
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::VoucherNotFound
            | Self::VoucherIdNotFound(_)
            | Self::BatchNotFound(_)
            | Self::ProfileNotFound(_) => ErrorKind::NotFound,
            Self::BatchNameExists { .. } | Self::UsernameExists { .. } | Self::BatchInUse { .. } => {
                ErrorKind::Conflict
            }
            Self::VoucherNotAvailable { .. }
            | Self::VoucherExpired
            | Self::BatchDisabled
            | Self::IllegalTransition { .. } => ErrorKind::State,
            Self::InvalidVoucherPassword => ErrorKind::Auth,
            Self::GenerationExhausted { .. } => ErrorKind::Generation,
            Self::TransactionConflict(_) | Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Stable machine-readable code.
    ///
    /// # Examples
    ///
    /// ```
    /// # use voucher_core::VoucherError;
    /// assert_eq!(VoucherError::VoucherNotFound.code(), "VOUCHER_NOT_FOUND");
    /// assert_eq!(VoucherError::BatchDisabled.code(), "BATCH_DISABLED");
    /// ```
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "INVALID_REQUEST",
            Self::VoucherNotFound => "VOUCHER_NOT_FOUND",
            Self::VoucherIdNotFound(_) => "NOT_FOUND",
            Self::BatchNotFound(_) => "BATCH_NOT_FOUND",
            Self::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Self::BatchNameExists { .. } => "NAME_EXISTS",
            Self::UsernameExists { .. } => "USERNAME_EXISTS",
            Self::BatchInUse { .. } => "IN_USE",
            Self::VoucherNotAvailable { .. } => "VOUCHER_NOT_AVAILABLE",
            Self::VoucherExpired => "VOUCHER_EXPIRED",
            Self::BatchDisabled => "BATCH_DISABLED",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::InvalidVoucherPassword => "INVALID_PASSWORD",
            Self::GenerationExhausted { .. } => "GENERATE_FAILED",
            Self::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            Self::Storage(_) => "DATABASE_ERROR",
        }
    }

    /// Returns `true` if the whole transaction may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_variants() -> Vec<VoucherError> {
        vec![
            VoucherError::validation("total_count", "out of range"),
            VoucherError::VoucherNotFound,
            VoucherError::VoucherIdNotFound(VoucherId(1)),
            VoucherError::BatchNotFound(BatchId(1)),
            VoucherError::ProfileNotFound(ProfileId(1)),
            VoucherError::BatchNameExists { name: "a".into() },
            VoucherError::UsernameExists { username: "u".into() },
            VoucherError::BatchInUse { used: 1 },
            VoucherError::VoucherNotAvailable { status: VoucherStatus::Used },
            VoucherError::VoucherExpired,
            VoucherError::BatchDisabled,
            VoucherError::IllegalTransition {
                from: VoucherStatus::Used,
                to: VoucherStatus::Disabled,
            },
            VoucherError::InvalidVoucherPassword,
            VoucherError::GenerationExhausted {
                attempts: 4,
                generated: 0,
                requested: 1,
            },
            VoucherError::TransactionConflict("deadlock".into()),
            VoucherError::Storage("boom".into()),
        ]
    }

    #[test]
    fn test_codes_are_distinct() {
        let variants = all_variants();
        let codes: HashSet<_> = variants.iter().map(VoucherError::code).collect();
        assert_eq!(codes.len(), variants.len());
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        for err in all_variants() {
            assert_eq!(
                err.is_retryable(),
                matches!(err, VoucherError::TransactionConflict(_)),
                "{err:?}"
            );
        }
    }

    #[test]
    fn test_not_available_reports_status() {
        let err = VoucherError::VoucherNotAvailable {
            status: VoucherStatus::Disabled,
        };
        assert_eq!(
            err.to_string(),
            "Voucher is not available for redemption (status: disabled)"
        );
        assert_eq!(err.kind(), ErrorKind::State);
    }
}
