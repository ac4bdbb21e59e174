//! Queue consumers: bounded concurrency, rate-limited starts, lease renewal
//! and stalled-job recovery.

pub mod pool;
pub mod processor;

use std::time::Duration;

use crate::limiter::StartLimit;

pub use pool::WorkerPool;
pub use processor::JobProcessor;

/// Lease timing for claimed jobs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LeaseSettings {
    /// Lock lifetime granted on claim and on every renewal.
    pub lock_duration: Duration,
    /// Renew once this fraction of the lock has elapsed.
    pub renew_at_fraction: f32,
    /// Renew no later than this before expiry.
    pub renew_min_margin: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(120),
            renew_at_fraction: 0.5,
            renew_min_margin: Duration::from_millis(2000),
        }
    }
}

impl LeaseSettings {
    /// Delay before the next renewal given the time left on the lock.
    pub fn renew_delay(&self, remaining: Duration) -> Duration {
        let target = self.lock_duration.mul_f32(1.0 - self.renew_at_fraction);
        if remaining > target {
            remaining - target
        } else if remaining > self.renew_min_margin {
            remaining - self.renew_min_margin
        } else {
            Duration::ZERO
        }
    }

    /// How long before its last confirmed expiry a worker gives up a lease
    /// it could not renew, so the stall scan never sees two owners.
    pub fn expiry_guard(&self) -> Duration {
        self.renew_min_margin.min(self.lock_duration / 10)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lease: LeaseSettings,
    pub start_limit: StartLimit,
    pub stalled_interval: Duration,
    /// Idle delay when the queue is empty or unreachable.
    pub poll_interval: Duration,
    pub result_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            lease: LeaseSettings::default(),
            start_limit: StartLimit::default(),
            stalled_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            result_ttl: Duration::from_secs(3 * 24 * 60 * 60),
        }
    }
}
