//! # Voucher Core
//!
//! Domain types and rules for prepaid network access vouchers.
//!
//! An operator issues a batch of single-use codes tied to a billing profile.
//! End users later redeem a code to create a network access account. This
//! crate holds everything about that lifecycle that does not perform I/O:
//!
//! - [`types`]: batches, vouchers, profiles, accounts and operation inputs
//! - [`code`]: collision-checked code generation from a secure RNG
//! - [`lifecycle`]: the voucher state machine and deadline arithmetic
//! - [`store`]: the transactional storage contract the engine runs against
//! - [`environment`]: injected clock
//! - [`error`]: the error taxonomy with stable machine-readable codes
//!
//! ## Lifecycle
//!
//! ```text
//! IssueBatch ──▶ available ──redeem──▶ used
//!                    │  └──expire──▶ expired
//!                    └─────disable─────▶ disabled
//! ```
//!
//! The engine that drives these rules against a store lives in
//! `voucher-runtime`.

pub mod code;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod store;
pub mod types;

pub use environment::{Clock, SystemClock};
pub use error::{ErrorKind, Result, VoucherError};
pub use lifecycle::Transition;
pub use store::{NewVoucher, VoucherStore, VoucherTransaction};
pub use types::{
    Account, AccountStatus, BatchFilter, BatchId, BatchStatus, BatchUpdate, BillingProfile,
    NewAccount, NewBatch, NodeId, ProfileFields, ProfileId, RedeemRequest, Redemption, UserId,
    Voucher, VoucherBatch, VoucherId, VoucherStatus,
};
