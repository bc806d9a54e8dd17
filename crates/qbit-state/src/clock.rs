//! Wall-clock abstraction.
//!
//! Block time bounds depend on "now"; tests pin it with [`ManualClock`] so
//! every validation run is reproducible.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// The system wall clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32
    }
}

/// A manually-driven clock for tests.
pub struct ManualClock(AtomicU32);

impl ManualClock {
    pub fn new(now: u32) -> Self {
        Self(AtomicU32::new(now))
    }

    pub fn set(&self, now: u32) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u32) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
