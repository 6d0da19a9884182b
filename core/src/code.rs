//! Voucher code generation.
//!
//! Codes are `PREFIX + core`, where the core is drawn uniformly from
//! `A-Z0-9` using a cryptographically secure RNG. The generator never
//! touches storage: the batch issuer feeds storage collisions back through
//! [`CodeSet::reject`] and the shared attempt budget.

use crate::error::{Result, VoucherError};
use rand::{CryptoRng, Rng, RngCore};
use std::collections::HashSet;

/// Alphabet for the random part of a code.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Normalize a user-supplied code for lookup.
///
/// # Examples
///
/// ```
/// use voucher_core::code::normalize_code;
///
/// assert_eq!(normalize_code("  vip3k9x2a1b "), "VIP3K9X2A1B");
/// ```
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Format parameters of a batch's codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFormat {
    prefix: String,
    length: usize,
}

impl CodeFormat {
    /// Create a format. The prefix is upper-cased.
    #[must_use]
    pub fn new(prefix: &str, length: usize) -> Self {
        Self {
            prefix: prefix.to_ascii_uppercase(),
            length,
        }
    }

    /// Code prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Length of the random part.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Generate one code.
    pub fn generate<R: RngCore + CryptoRng>(&self, rng: &mut R) -> String {
        let mut code = String::with_capacity(self.prefix.len() + self.length);
        code.push_str(&self.prefix);
        code.extend((0..self.length).map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            char::from(CODE_ALPHABET[idx])
        }));
        code
    }
}

/// Working set of unique codes for one issuance, with a bounded attempt
/// budget shared by in-set and storage collisions.
#[derive(Debug)]
pub struct CodeSet {
    format: CodeFormat,
    requested: usize,
    max_attempts: usize,
    attempts: usize,
    collisions: usize,
    codes: HashSet<String>,
}

impl CodeSet {
    /// Create an empty working set for `requested` codes.
    ///
    /// At most `requested * retry_factor` codes are drawn in total.
    #[must_use]
    pub fn new(format: CodeFormat, requested: usize, retry_factor: usize) -> Self {
        Self {
            format,
            requested,
            max_attempts: requested.saturating_mul(retry_factor.max(1)),
            attempts: 0,
            collisions: 0,
            codes: HashSet::with_capacity(requested),
        }
    }

    /// Draw codes until the set holds `requested` distinct codes.
    ///
    /// Returns the codes added by this call, so that only those need a
    /// storage collision check.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherError::GenerationExhausted`] once the attempt budget
    /// is spent.
    pub fn fill<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<String>> {
        let mut added = Vec::with_capacity(self.requested.saturating_sub(self.codes.len()));
        while self.codes.len() < self.requested {
            if self.attempts >= self.max_attempts {
                return Err(VoucherError::GenerationExhausted {
                    attempts: self.attempts,
                    generated: self.codes.len(),
                    requested: self.requested,
                });
            }
            self.attempts += 1;

            let code = self.format.generate(rng);
            if self.codes.insert(code.clone()) {
                added.push(code);
            } else {
                self.collisions += 1;
            }
        }
        Ok(added)
    }

    /// Drop codes that collided with storage. The next [`fill`](Self::fill)
    /// replaces them.
    pub fn reject<'a>(&mut self, taken: impl IntoIterator<Item = &'a String>) {
        for code in taken {
            if self.codes.remove(code) {
                self.collisions += 1;
            }
        }
    }

    /// Codes drawn so far, including rejected ones.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        self.attempts
    }

    /// Collisions seen so far.
    #[must_use]
    pub const fn collisions(&self) -> usize {
        self.collisions
    }

    /// Consume the set.
    #[must_use]
    pub fn into_codes(self) -> Vec<String> {
        self.codes.into_iter().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_code_has_prefix_and_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let format = CodeFormat::new("vip", 8);
        let code = format.generate(&mut rng);
        assert!(code.starts_with("VIP"));
        assert_eq!(code.len(), 11);
        assert!(code[3..].bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_fill_produces_requested_unique_codes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut set = CodeSet::new(CodeFormat::new("", 10), 500, 4);
        let added = set.fill(&mut rng).unwrap();
        assert_eq!(added.len(), 500);
        let codes = set.into_codes();
        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), 500);
    }

    #[test]
    fn test_rejected_codes_are_replaced() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut set = CodeSet::new(CodeFormat::new("X", 6), 10, 4);
        let first = set.fill(&mut rng).unwrap();
        set.reject(first.iter().take(3));
        let replaced = set.fill(&mut rng).unwrap();
        assert_eq!(replaced.len(), 3);
        assert_eq!(set.collisions(), 3);
        assert_eq!(set.into_codes().len(), 10);
    }

    #[test]
    fn test_budget_exhaustion() {
        // Every drawn code "collides with storage".
        let mut rng = StdRng::seed_from_u64(3);
        let mut set = CodeSet::new(CodeFormat::new("", 6), 2, 2);
        let mut last = Ok(Vec::new());
        for _ in 0..4 {
            last = set.fill(&mut rng);
            match &last {
                Ok(added) => {
                    let added = added.clone();
                    set.reject(added.iter());
                }
                Err(_) => break,
            }
        }
        assert!(matches!(
            last,
            Err(VoucherError::GenerationExhausted { attempts: 4, requested: 2, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_codes_are_uppercase_alphanumeric(
            seed in any::<u64>(),
            prefix in "[a-zA-Z0-9]{0,10}",
            length in 6usize..=32,
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let format = CodeFormat::new(&prefix, length);
            let code = format.generate(&mut rng);
            let upper_prefix = prefix.to_ascii_uppercase();
            prop_assert!(code.starts_with(&upper_prefix));
            prop_assert_eq!(code.len(), prefix.len() + length);
            prop_assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
            prop_assert_eq!(normalize_code(&code.to_lowercase()), code);
        }
    }
}
