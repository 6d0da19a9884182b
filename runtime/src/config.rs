//! Engine configuration.
//!
//! # Example
//!
//! ```rust
//! use voucher_runtime::{EngineConfig, PasswordMismatchPolicy};
//!
//! let config = EngineConfig::new()
//!     .with_code_retry_factor(8)
//!     .with_password_mismatch(PasswordMismatchPolicy::MaskAsNotFound);
//! assert_eq!(config.insert_chunk_size, 100);
//! ```

use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use voucher_core::VoucherError;
use voucher_core::types::{MAX_CODE_LENGTH, MIN_CODE_LENGTH};

/// Largest insert chunk. Each voucher row takes 8 bind parameters and
/// `PostgreSQL` allows 65535 per statement.
pub const MAX_INSERT_CHUNK_SIZE: usize = 1000;

/// How a wrong voucher password is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordMismatchPolicy {
    /// Report [`VoucherError::InvalidVoucherPassword`].
    #[default]
    Distinct,
    /// Report [`VoucherError::VoucherNotFound`], so that a caller cannot
    /// tell a valid code with a wrong password from an unknown code.
    MaskAsNotFound,
}

impl PasswordMismatchPolicy {
    /// Error to surface for a password mismatch.
    #[must_use]
    pub const fn error(&self) -> VoucherError {
        match self {
            Self::Distinct => VoucherError::InvalidVoucherPassword,
            Self::MaskAsNotFound => VoucherError::VoucherNotFound,
        }
    }
}

/// Tunables of [`VoucherEngine`](crate::VoucherEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Code draws allowed per requested voucher before issuance fails.
    pub code_retry_factor: usize,
    /// Vouchers per insert statement and per storage collision check.
    pub insert_chunk_size: usize,
    /// Code length used when a batch asks for less than the minimum.
    pub default_code_length: i32,
    /// Reporting of wrong voucher passwords.
    pub password_mismatch: PasswordMismatchPolicy,
    /// Retry of transaction conflicts.
    pub conflict_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            code_retry_factor: 4,
            insert_chunk_size: 100,
            default_code_length: 10,
            password_mismatch: PasswordMismatchPolicy::Distinct,
            conflict_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Reads:
    /// - `VOUCHER_CODE_RETRY_FACTOR` (default: 4)
    /// - `VOUCHER_INSERT_CHUNK_SIZE` (default: 100)
    /// - `VOUCHER_DEFAULT_CODE_LENGTH` (default: 10)
    /// - `VOUCHER_MASK_PASSWORD_MISMATCH` (default: false)
    /// - `VOUCHER_CONFLICT_MAX_RETRIES` (default: 3)
    ///
    /// Unparseable or out-of-range values fall back to the default. The
    /// code length must lie in `6..=32` and the chunk size must not exceed
    /// [`MAX_INSERT_CHUNK_SIZE`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let code_retry_factor = parse_var(&lookup, "VOUCHER_CODE_RETRY_FACTOR")
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.code_retry_factor);

        let insert_chunk_size = parse_var(&lookup, "VOUCHER_INSERT_CHUNK_SIZE")
            .filter(|n: &usize| (1..=MAX_INSERT_CHUNK_SIZE).contains(n))
            .unwrap_or(defaults.insert_chunk_size);

        let default_code_length = parse_var(&lookup, "VOUCHER_DEFAULT_CODE_LENGTH")
            .filter(|n: &i32| (MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(n))
            .unwrap_or(defaults.default_code_length);

        let password_mismatch = match parse_var(&lookup, "VOUCHER_MASK_PASSWORD_MISMATCH") {
            Some(true) => PasswordMismatchPolicy::MaskAsNotFound,
            _ => PasswordMismatchPolicy::Distinct,
        };

        let max_retries = parse_var(&lookup, "VOUCHER_CONFLICT_MAX_RETRIES")
            .unwrap_or(defaults.conflict_retry.max_retries);

        Self {
            code_retry_factor,
            insert_chunk_size,
            default_code_length,
            password_mismatch,
            conflict_retry: RetryPolicy {
                max_retries,
                ..defaults.conflict_retry
            },
        }
    }

    /// Set the code retry factor.
    #[must_use]
    pub fn with_code_retry_factor(mut self, factor: usize) -> Self {
        self.code_retry_factor = factor.max(1);
        self
    }

    /// Set the insert chunk size.
    #[must_use]
    pub fn with_insert_chunk_size(mut self, size: usize) -> Self {
        self.insert_chunk_size = size.clamp(1, MAX_INSERT_CHUNK_SIZE);
        self
    }

    /// Set the default code length.
    #[must_use]
    pub const fn with_default_code_length(mut self, length: i32) -> Self {
        self.default_code_length = length;
        self
    }

    /// Set the password mismatch policy.
    #[must_use]
    pub const fn with_password_mismatch(mut self, policy: PasswordMismatchPolicy) -> Self {
        self.password_mismatch = policy;
        self
    }

    /// Set the conflict retry policy.
    #[must_use]
    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    /// Shorthand for a conflict retry policy with a short fixed base delay.
    #[must_use]
    pub fn with_conflict_retries(mut self, max_retries: usize, initial_delay: Duration) -> Self {
        self.conflict_retry = RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(initial_delay)
            .build();
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.code_retry_factor, 4);
        assert_eq!(config.insert_chunk_size, 100);
        assert_eq!(config.default_code_length, 10);
        assert_eq!(config.password_mismatch, PasswordMismatchPolicy::Distinct);
    }

    #[test]
    fn test_builders_clamp_to_one() {
        let config = EngineConfig::new()
            .with_code_retry_factor(0)
            .with_insert_chunk_size(0);
        assert_eq!(config.code_retry_factor, 1);
        assert_eq!(config.insert_chunk_size, 1);
    }

    #[test]
    fn test_chunk_size_capped() {
        let config = EngineConfig::new().with_insert_chunk_size(50_000);
        assert_eq!(config.insert_chunk_size, MAX_INSERT_CHUNK_SIZE);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_values_in_range_are_used() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("VOUCHER_CODE_RETRY_FACTOR", "8"),
            ("VOUCHER_INSERT_CHUNK_SIZE", "1000"),
            ("VOUCHER_DEFAULT_CODE_LENGTH", " 32 "),
            ("VOUCHER_MASK_PASSWORD_MISMATCH", "true"),
            ("VOUCHER_CONFLICT_MAX_RETRIES", "5"),
        ]));
        assert_eq!(config.code_retry_factor, 8);
        assert_eq!(config.insert_chunk_size, 1000);
        assert_eq!(config.default_code_length, 32);
        assert_eq!(config.password_mismatch, PasswordMismatchPolicy::MaskAsNotFound);
        assert_eq!(config.conflict_retry.max_retries, 5);
    }

    #[test]
    fn test_env_values_out_of_range_fall_back() {
        let defaults = EngineConfig::default();
        for (chunk, length) in [("0", "5"), ("1001", "33"), ("many", "-10")] {
            let config = EngineConfig::from_lookup(lookup(&[
                ("VOUCHER_INSERT_CHUNK_SIZE", chunk),
                ("VOUCHER_DEFAULT_CODE_LENGTH", length),
            ]));
            assert_eq!(config.insert_chunk_size, defaults.insert_chunk_size);
            assert_eq!(config.default_code_length, defaults.default_code_length);
        }
        assert_eq!(EngineConfig::from_lookup(|_| None), defaults);
    }

    #[test]
    fn test_mismatch_policy_errors() {
        assert_eq!(
            PasswordMismatchPolicy::Distinct.error(),
            VoucherError::InvalidVoucherPassword
        );
        assert_eq!(
            PasswordMismatchPolicy::MaskAsNotFound.error(),
            VoucherError::VoucherNotFound
        );
    }
}
