//! Injected dependencies other than storage.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability.
///
/// Deadlines, redemption timestamps and account expirations are all
/// computed from the injected clock.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
