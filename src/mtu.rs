//! Path MTU discovery.
//!
//! After a connection is established, probes of increasing size are sent and
//! echoed back by the remote peer. Successful probes raise the usable MTU;
//! failures bound the search from above. The search grows by 1.25x until the
//! first failure, then bisects between the largest success and the smallest
//! failure.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::protocol::MTU_PROBE_CAP;

/// Starting point of the success bound; everything routes at least this.
const INITIAL_LARGEST_SUCCESS: usize = 512;
/// Growth factor while no failure is known.
const GROWTH_NUM: usize = 5;
const GROWTH_DEN: usize = 4;
/// Probe timeouts tolerated before discovery gives up. This hard limit wins
/// over the configured send-failure budget when it trips first.
const MAX_PROBE_TIMEOUTS: u32 = 3;
/// Extra settling time before the first probe.
const FIRST_PROBE_GRACE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Discovery has not been started or is disabled.
    Idle,
    /// Waiting until the next probe is due.
    Waiting { until: Instant },
    /// A probe is in flight.
    AwaitingReply { size: usize, sent_at: Instant },
    Finalized,
}

/// What the connection should do for MTU discovery this heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuAction {
    None,
    /// Send a probe datagram padded to exactly this many bytes.
    SendProbe(usize),
}

#[derive(Debug)]
pub struct MtuDiscovery {
    phase: Phase,
    largest_success: usize,
    smallest_failure: Option<usize>,
    timeouts: u32,
    send_failures: u32,
    expand_interval: Duration,
    fail_attempts: u8,
}

impl MtuDiscovery {
    pub fn new(expand_interval: Duration, fail_attempts: u8) -> Self {
        Self {
            phase: Phase::Idle,
            largest_success: INITIAL_LARGEST_SUCCESS,
            smallest_failure: None,
            timeouts: 0,
            send_failures: 0,
            expand_interval,
            fail_attempts,
        }
    }

    /// Schedules the first probe; called on entering the connected state.
    pub fn start(&mut self, now: Instant, average_rtt: Duration) {
        self.phase = Phase::Waiting {
            until: now + self.expand_interval + average_rtt + FIRST_PROBE_GRACE,
        };
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == Phase::Finalized
    }

    /// Size the next probe should have, given the current MTU.
    fn next_probe_size(&self, current_mtu: usize) -> usize {
        let target = match self.smallest_failure {
            None => current_mtu * GROWTH_NUM / GROWTH_DEN,
            Some(failure) => (failure + self.largest_success) / 2,
        };
        target.min(MTU_PROBE_CAP)
    }

    /// Drives the probe timers. The connection sends the returned probe and
    /// reports the outcome through `on_probe_sent` / `on_send_failure`.
    pub fn heartbeat(&mut self, now: Instant, current_mtu: usize) -> MtuAction {
        match self.phase {
            Phase::Idle | Phase::Finalized => MtuAction::None,
            Phase::Waiting { until } => {
                if now < until {
                    return MtuAction::None;
                }
                let target = self.next_probe_size(current_mtu);
                if target <= self.largest_success {
                    debug!(mtu = current_mtu, "path MTU search converged");
                    self.phase = Phase::Finalized;
                    return MtuAction::None;
                }
                MtuAction::SendProbe(target)
            }
            Phase::AwaitingReply { sent_at, .. } => {
                if now.duration_since(sent_at) >= self.expand_interval {
                    self.timeouts += 1;
                    if self.timeouts >= MAX_PROBE_TIMEOUTS {
                        debug!(timeouts = self.timeouts, "probe timeouts exhausted, keeping current MTU");
                        self.phase = Phase::Finalized;
                    } else {
                        self.phase = Phase::Waiting { until: now };
                    }
                }
                MtuAction::None
            }
        }
    }

    pub fn on_probe_sent(&mut self, size: usize, now: Instant) {
        self.phase = Phase::AwaitingReply { size, sent_at: now };
    }

    /// The OS refused the datagram: the size is conclusively too large.
    pub fn on_send_failure(&mut self, size: usize, now: Instant) {
        if self
            .smallest_failure
            .map_or(true, |existing| size < existing)
        {
            self.smallest_failure = Some(size);
        }
        self.send_failures += 1;
        if self.send_failures >= self.fail_attempts as u32 {
            debug!(failures = self.send_failures, "probe send failures exhausted");
            self.phase = Phase::Finalized;
        } else {
            self.phase = Phase::Waiting { until: now };
        }
    }

    /// The remote echoed a probe. Records the success bound and returns the
    /// new MTU when it grew beyond the current one.
    pub fn on_probe_success(&mut self, size: usize, now: Instant, current_mtu: usize) -> Option<usize> {
        if self.phase == Phase::Finalized {
            return None;
        }
        self.largest_success = self.largest_success.max(size);
        self.timeouts = 0;
        self.phase = Phase::Waiting { until: now };
        if size > current_mtu {
            debug!(mtu = size, "path MTU raised");
            Some(size)
        } else {
            None
        }
    }
}
