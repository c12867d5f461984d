//! Wall-clock source for round expiry decisions.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Unix seconds, clamped at zero.
    fn now_unix(&self) -> u64 {
        u64::try_from(self.now().timestamp()).unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    unix_secs: AtomicI64,
}

impl ManualClock {
    pub fn at(unix_secs: i64) -> Self {
        Self {
            unix_secs: AtomicI64::new(unix_secs),
        }
    }

    pub fn set(&self, unix_secs: i64) {
        self.unix_secs.store(unix_secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.unix_secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.unix_secs.load(Ordering::SeqCst);
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }
}
