//! Time source for the auth core.
//!
//! Rate limiter decay and session timestamps are computed from an injected [`Clock`] rather than
//! calling `Utc::now()` directly, so tests can drive time explicitly.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
