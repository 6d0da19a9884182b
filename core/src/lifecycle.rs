//! Voucher state machine.
//!
//! ```text
//!              expire (deadline passed)
//!   available ───────────────────────────▶ expired
//!       │  │                                  │
//!       │  └──── redeem ──▶ used (terminal)   │
//!       │                                     │
//!       └──────── disable ──▶ disabled ◀──────┘
//! ```
//!
//! Nothing leaves `used`. Every transition not in the table is rejected
//! with [`VoucherError::IllegalTransition`].

use crate::error::{Result, VoucherError};
use crate::types::{Voucher, VoucherBatch, VoucherStatus};
use chrono::{DateTime, Duration, Utc};

/// Trigger of a voucher state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Lazy expiry discovered during redemption.
    Expire,
    /// Successful redemption.
    Redeem,
    /// Administrative disable.
    Disable,
}

impl Transition {
    /// Status the voucher ends up in.
    #[must_use]
    pub const fn target(&self) -> VoucherStatus {
        match self {
            Self::Expire => VoucherStatus::Expired,
            Self::Redeem => VoucherStatus::Used,
            Self::Disable => VoucherStatus::Disabled,
        }
    }

    /// Statuses this transition may start from.
    #[must_use]
    pub const fn sources(&self) -> &'static [VoucherStatus] {
        match self {
            Self::Expire | Self::Redeem => &[VoucherStatus::Available],
            Self::Disable => &[VoucherStatus::Available, VoucherStatus::Expired],
        }
    }

    /// Check that the transition is legal from `from`.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::IllegalTransition`] otherwise.
    pub fn check(&self, from: VoucherStatus) -> Result<VoucherStatus> {
        if self.sources().contains(&from) {
            Ok(self.target())
        } else {
            Err(VoucherError::IllegalTransition {
                from,
                to: self.target(),
            })
        }
    }
}

/// Returns `true` if a voucher in `status` can never be redeemed.
///
/// `expired` is included although it still admits [`Transition::Disable`].
#[must_use]
pub const fn is_terminal(status: VoucherStatus) -> bool {
    matches!(
        status,
        VoucherStatus::Used | VoucherStatus::Expired | VoucherStatus::Disabled
    )
}

/// The voucher's redemption deadline: its own, else the batch's.
#[must_use]
pub fn effective_deadline(voucher: &Voucher, batch: &VoucherBatch) -> DateTime<Utc> {
    voucher.expire_time.unwrap_or(batch.expire_time)
}

/// Returns `true` if an `available` voucher has passed its deadline.
#[must_use]
pub fn is_past_deadline(voucher: &Voucher, batch: &VoucherBatch, now: DateTime<Utc>) -> bool {
    effective_deadline(voucher, batch) < now
}

/// Expiration of the account created by redeeming `voucher`.
///
/// `now + valid_days` when the batch sets a validity window, else the
/// voucher's own deadline, else the batch's.
#[must_use]
pub fn account_expiration(
    voucher: &Voucher,
    batch: &VoucherBatch,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if batch.valid_days > 0 {
        now + Duration::days(i64::from(batch.valid_days))
    } else {
        effective_deadline(voucher, batch)
    }
}
