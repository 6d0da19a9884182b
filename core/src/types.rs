//! Voucher domain types.
//!
//! Records mirror the durable rows (`voucher_batch`, `voucher`, billing
//! profile, account) and the already-normalized inputs accepted by the
//! engine's public operations. Coercion from loosely typed transport
//! payloads happens before these types are built.

use crate::error::{Result, VoucherError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
// ID Types
// ═══════════════════════════════════════════════════════════════════════

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a voucher batch.
    BatchId
);
id_type!(
    /// Identity of a single voucher.
    VoucherId
);
id_type!(
    /// Identity of a billing profile.
    ProfileId
);
id_type!(
    /// Identity of a network node.
    NodeId
);
id_type!(
    /// Identity of a network access account.
    UserId
);

// ═══════════════════════════════════════════════════════════════════════
// Status Types
// ═══════════════════════════════════════════════════════════════════════

/// Administrative status of a voucher batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Member vouchers may be redeemed.
    #[default]
    Enabled,
    /// Redemption of member vouchers is refused.
    Disabled,
}

impl BatchStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }

    /// Parse status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Validation`] for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            other => Err(VoucherError::validation(
                "status",
                format!("unknown batch status '{other}'"),
            )),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a voucher.
///
/// See [`crate::lifecycle`] for the legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    /// Issued and redeemable.
    #[default]
    Available,
    /// Redeemed. Terminal.
    Used,
    /// Deadline passed before redemption.
    Expired,
    /// Administratively withdrawn. Terminal.
    Disabled,
}

impl VoucherStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::Disabled => "disabled",
        }
    }

    /// Parse status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Storage`] for unknown values, since statuses
    /// only ever come from stored rows.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(Self::Available),
            "used" => Ok(Self::Used),
            "expired" => Ok(Self::Expired),
            "disabled" => Ok(Self::Disabled),
            _ => Err(VoucherError::Storage(format!("Invalid voucher status: {s}"))),
        }
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a network access account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Account may authenticate.
    #[default]
    Enabled,
    /// Account is suspended.
    Disabled,
}

impl AccountStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════

/// A named group of vouchers sharing issuance parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherBatch {
    /// Batch identity.
    pub id: BatchId,
    /// Owning network node.
    pub node_id: NodeId,
    /// Display name, unique among non-deleted batches.
    pub name: String,
    /// Billing profile applied to redeemed accounts.
    pub profile_id: ProfileId,
    /// Number of vouchers issued with the batch.
    pub total_count: i32,
    /// Number of vouchers redeemed so far.
    pub used_count: i32,
    /// Redemption deadline for member vouchers.
    pub expire_time: DateTime<Utc>,
    /// Account validity after redemption. 0 inherits the voucher deadline.
    pub valid_days: i32,
    /// Code prefix.
    pub prefix: String,
    /// Length of the random part of each code.
    pub code_length: i32,
    /// Administrative status.
    pub status: BatchStatus,
    /// Free-text remark.
    pub remark: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A single-use prepaid code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Voucher identity.
    pub id: VoucherId,
    /// Owning batch. Never changes.
    pub batch_id: BatchId,
    /// Upper-cased code, unique across the system.
    pub code: String,
    /// Optional extra redemption secret. Empty means none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Billing profile inherited from the batch.
    pub profile_id: ProfileId,
    /// Lifecycle status.
    pub status: VoucherStatus,
    /// Account created by the redemption.
    pub user_id: Option<UserId>,
    /// Redemption time. Present exactly when `user_id` is.
    pub redeemed_at: Option<DateTime<Utc>>,
    /// Per-voucher deadline. Falls back to the batch deadline when unset.
    pub expire_time: Option<DateTime<Utc>>,
    /// Free-text remark.
    pub remark: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Voucher {
    /// The redemption password, if one is set and non-empty.
    #[must_use]
    pub fn required_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Copy of this voucher with the password removed.
    #[must_use]
    pub fn redacted(mut self) -> Self {
        self.password = None;
        self
    }
}

/// Network and billing attributes applied to redeemed accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingProfile {
    /// Profile identity.
    pub id: ProfileId,
    /// Display name.
    pub name: String,
    /// Address pool name.
    pub addr_pool: String,
    /// Maximum concurrent sessions.
    pub active_num: i32,
    /// Upload rate limit in Kbps.
    pub up_rate: i32,
    /// Download rate limit in Kbps.
    pub down_rate: i32,
    /// Authentication domain.
    pub domain: String,
    /// Bind the account to the first MAC address seen.
    pub bind_mac: bool,
    /// Bind the account to the first VLAN seen.
    pub bind_vlan: bool,
}

/// A network access account created by redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identity.
    pub id: UserId,
    /// Billing profile.
    pub profile_id: ProfileId,
    /// Login name.
    pub username: String,
    /// Account password. Never serialized.
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Real name.
    pub realname: String,
    /// Contact phone.
    pub mobile: String,
    /// Contact e-mail.
    pub email: String,
    /// Address pool copied from the profile.
    pub addr_pool: String,
    /// Session limit copied from the profile.
    pub active_num: i32,
    /// Upload rate copied from the profile.
    pub up_rate: i32,
    /// Download rate copied from the profile.
    pub down_rate: i32,
    /// Domain copied from the profile.
    pub domain: String,
    /// MAC binding policy copied from the profile.
    pub bind_mac: bool,
    /// VLAN binding policy copied from the profile.
    pub bind_vlan: bool,
    /// Account status.
    pub status: AccountStatus,
    /// Account expiration.
    pub expire_time: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Account row to be created by the account store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    /// Billing profile.
    pub profile_id: ProfileId,
    /// Login name.
    pub username: String,
    /// Account password as supplied by the user.
    pub password: String,
    /// Real name.
    pub realname: String,
    /// Contact phone.
    pub mobile: String,
    /// Contact e-mail.
    pub email: String,
    /// Address pool.
    pub addr_pool: String,
    /// Session limit.
    pub active_num: i32,
    /// Upload rate.
    pub up_rate: i32,
    /// Download rate.
    pub down_rate: i32,
    /// Domain.
    pub domain: String,
    /// MAC binding policy.
    pub bind_mac: bool,
    /// VLAN binding policy.
    pub bind_vlan: bool,
    /// Account status.
    pub status: AccountStatus,
    /// Account expiration.
    pub expire_time: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl NewAccount {
    /// Build the account row for a redemption, copying the network and
    /// billing attributes from `profile`.
    #[must_use]
    pub fn from_profile(
        profile: &BillingProfile,
        request: &RedeemRequest,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            profile_id: profile.id,
            username: request.username.trim().to_string(),
            password: request.password.clone(),
            realname: request.profile.realname.clone(),
            mobile: request.profile.mobile.clone(),
            email: request.profile.email.clone(),
            addr_pool: profile.addr_pool.clone(),
            active_num: profile.active_num,
            up_rate: profile.up_rate,
            down_rate: profile.down_rate,
            domain: profile.domain.clone(),
            bind_mac: profile.bind_mac,
            bind_vlan: profile.bind_vlan,
            status: AccountStatus::Enabled,
            expire_time,
            created_at: now,
        }
    }

    /// Materialize the stored account once the store has assigned an id.
    #[must_use]
    pub fn into_account(self, id: UserId) -> Account {
        Account {
            id,
            profile_id: self.profile_id,
            username: self.username,
            password: self.password,
            realname: self.realname,
            mobile: self.mobile,
            email: self.email,
            addr_pool: self.addr_pool,
            active_num: self.active_num,
            up_rate: self.up_rate,
            down_rate: self.down_rate,
            domain: self.domain,
            bind_mac: self.bind_mac,
            bind_vlan: self.bind_vlan,
            status: self.status,
            expire_time: self.expire_time,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Operation Inputs
// ═══════════════════════════════════════════════════════════════════════

/// Maximum number of vouchers in one batch.
pub const MAX_TOTAL_COUNT: i32 = 10_000;
/// Maximum post-redemption validity window.
pub const MAX_VALID_DAYS: i32 = 3650;
/// Minimum random code length.
pub const MIN_CODE_LENGTH: i32 = 6;
/// Maximum random code length.
pub const MAX_CODE_LENGTH: i32 = 32;
/// Maximum prefix length.
pub const MAX_PREFIX_LENGTH: usize = 10;
/// Maximum batch name length.
pub const MAX_NAME_LENGTH: usize = 100;
/// Maximum remark length.
pub const MAX_REMARK_LENGTH: usize = 500;

/// Parameters for issuing a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    /// Display name.
    pub name: String,
    /// Owning network node.
    pub node_id: NodeId,
    /// Billing profile for redeemed accounts.
    pub profile_id: ProfileId,
    /// Number of vouchers to issue.
    pub total_count: i32,
    /// Redemption deadline.
    pub expire_time: DateTime<Utc>,
    /// Post-redemption validity in days.
    pub valid_days: i32,
    /// Code prefix.
    pub prefix: String,
    /// Length of the random part of each code.
    pub code_length: i32,
    /// Initial status. Unset means enabled.
    pub status: Option<BatchStatus>,
    /// Free-text remark.
    pub remark: String,
}

impl NewBatch {
    /// Validate and normalize the request.
    ///
    /// Trims the name, upper-cases the prefix, fills the default status and
    /// raises a code length below the minimum to `default_code_length`.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Validation`] for out-of-range fields.
    pub fn normalize(mut self, default_code_length: i32) -> Result<Self> {
        self.name = validate_name(&self.name)?;

        if !(1..=MAX_TOTAL_COUNT).contains(&self.total_count) {
            return Err(VoucherError::validation(
                "total_count",
                format!("must be between 1 and {MAX_TOTAL_COUNT}"),
            ));
        }
        validate_valid_days(self.valid_days)?;

        let prefix = self.prefix.trim();
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(VoucherError::validation(
                "prefix",
                format!("must be at most {MAX_PREFIX_LENGTH} characters"),
            ));
        }
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(VoucherError::validation(
                "prefix",
                "must contain only ASCII letters and digits",
            ));
        }
        self.prefix = prefix.to_ascii_uppercase();

        if self.code_length < MIN_CODE_LENGTH {
            self.code_length = default_code_length;
        }
        if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&self.code_length) {
            return Err(VoucherError::validation(
                "code_length",
                format!("must be between {MIN_CODE_LENGTH} and {MAX_CODE_LENGTH}"),
            ));
        }

        validate_remark(&self.remark)?;
        self.status.get_or_insert(BatchStatus::Enabled);
        Ok(self)
    }
}

/// Partial update of a batch. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdate {
    /// New name.
    pub name: Option<String>,
    /// New network node.
    pub node_id: Option<NodeId>,
    /// New billing profile.
    pub profile_id: Option<ProfileId>,
    /// New redemption deadline.
    pub expire_time: Option<DateTime<Utc>>,
    /// New validity window.
    pub valid_days: Option<i32>,
    /// New status.
    pub status: Option<BatchStatus>,
    /// New remark.
    pub remark: Option<String>,
}

impl BatchUpdate {
    /// Validate and normalize the present fields.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Validation`] for out-of-range fields.
    pub fn normalize(mut self) -> Result<Self> {
        if let Some(name) = self.name.take() {
            self.name = Some(validate_name(&name)?);
        }
        if let Some(days) = self.valid_days {
            validate_valid_days(days)?;
        }
        if let Some(remark) = &self.remark {
            validate_remark(remark)?;
        }
        Ok(self)
    }

    /// Returns `true` if no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.node_id.is_none()
            && self.profile_id.is_none()
            && self.expire_time.is_none()
            && self.valid_days.is_none()
            && self.status.is_none()
            && self.remark.is_none()
    }

    /// Apply the present fields to `batch`.
    pub fn apply(&self, batch: &mut VoucherBatch, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            batch.name.clone_from(name);
        }
        if let Some(node_id) = self.node_id {
            batch.node_id = node_id;
        }
        if let Some(profile_id) = self.profile_id {
            batch.profile_id = profile_id;
        }
        if let Some(expire_time) = self.expire_time {
            batch.expire_time = expire_time;
        }
        if let Some(valid_days) = self.valid_days {
            batch.valid_days = valid_days;
        }
        if let Some(status) = self.status {
            batch.status = status;
        }
        if let Some(remark) = &self.remark {
            batch.remark.clone_from(remark);
        }
        batch.updated_at = now;
    }
}

/// Filter for batch listings. Unset fields match every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    /// Exact status.
    pub status: Option<BatchStatus>,
    /// Case-insensitive substring of the name.
    pub name: Option<String>,
}

impl BatchFilter {
    /// Trim the name and drop it when blank.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        self.name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self
    }

    /// Returns `true` if `batch` passes the filter.
    #[must_use]
    pub fn matches(&self, batch: &VoucherBatch) -> bool {
        self.status.is_none_or(|s| s == batch.status)
            && self.name.as_deref().is_none_or(|n| {
                batch
                    .name
                    .to_lowercase()
                    .contains(&n.to_lowercase())
            })
    }
}

/// Optional personal details attached to a redeemed account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    /// Real name.
    pub realname: String,
    /// Contact phone.
    pub mobile: String,
    /// Contact e-mail.
    pub email: String,
}

/// Input for a voucher redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    /// Voucher code, any case.
    pub code: String,
    /// Voucher password, if the voucher has one.
    pub voucher_password: Option<String>,
    /// Desired account username.
    pub username: String,
    /// Desired account password.
    pub password: String,
    /// Optional personal details.
    #[serde(default)]
    pub profile: ProfileFields,
}

impl RedeemRequest {
    /// Create a request without a voucher password or personal details.
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            voucher_password: None,
            username: username.into(),
            password: password.into(),
            profile: ProfileFields::default(),
        }
    }

    /// Set the voucher password.
    #[must_use]
    pub fn with_voucher_password(mut self, password: impl Into<String>) -> Self {
        self.voucher_password = Some(password.into());
        self
    }

    /// Set the personal details.
    #[must_use]
    pub fn with_profile(mut self, profile: ProfileFields) -> Self {
        self.profile = profile;
        self
    }

    /// Validate the request before a transaction is opened.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::Validation`] for an empty code, a username
    /// outside 3..=50 characters or a password outside 6..=128 characters.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(VoucherError::validation("code", "must not be empty"));
        }
        let username_len = self.username.trim().chars().count();
        if !(3..=50).contains(&username_len) {
            return Err(VoucherError::validation(
                "username",
                "must be between 3 and 50 characters",
            ));
        }
        let password_len = self.password.chars().count();
        if !(6..=128).contains(&password_len) {
            return Err(VoucherError::validation(
                "password",
                "must be between 6 and 128 characters",
            ));
        }
        Ok(())
    }
}

/// Successful redemption: the created account and the consumed voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    /// Newly created account, password cleared.
    pub account: Account,
    /// Voucher in its `used` state, password cleared.
    pub voucher: Voucher,
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
        return Err(VoucherError::validation(
            "name",
            format!("must be between 1 and {MAX_NAME_LENGTH} characters"),
        ));
    }
    Ok(name.to_string())
}

fn validate_valid_days(days: i32) -> Result<()> {
    if (0..=MAX_VALID_DAYS).contains(&days) {
        Ok(())
    } else {
        Err(VoucherError::validation(
            "valid_days",
            format!("must be between 0 and {MAX_VALID_DAYS}"),
        ))
    }
}

fn validate_remark(remark: &str) -> Result<()> {
    if remark.chars().count() > MAX_REMARK_LENGTH {
        return Err(VoucherError::validation(
            "remark",
            format!("must be at most {MAX_REMARK_LENGTH} characters"),
        ));
    }
    Ok(())
}
