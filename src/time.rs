use std::fmt::Debug;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Source of time for the transport.
///
/// The transport never calls `Instant::now()` directly; everything is driven
/// through a provider so that tests can run the full protocol deterministically.
pub trait TimeProvider: Send + Sync + Debug {
    /// Monotonic clock used for all protocol timers.
    fn now_instant(&self) -> Instant;
    /// Wall-clock milliseconds, exchanged with the remote peer for clock
    /// offset estimation.
    fn now_system_ms(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    system_ms: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, system_ms: i64) -> Self {
        Self {
            instant: RwLock::new(instant),
            system_ms: RwLock::new(system_ms),
        }
    }

    pub fn set_time(&self, instant: Instant, system_ms: i64) {
        *self.instant.write() = instant;
        *self.system_ms.write() = system_ms;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write() += duration;
        *self.system_ms.write() += duration.as_millis() as i64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read()
    }

    fn now_system_ms(&self) -> i64 {
        *self.system_ms.read()
    }
}
