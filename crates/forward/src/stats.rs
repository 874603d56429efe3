use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-session counters. Written by the session and its pumps, read by
/// diagnostics and tests; never consulted by the forwarding logic itself.
#[derive(Debug, Default)]
pub struct SessionStats {
    accepted: AtomicU64,
    active_pumps: AtomicU64,
    pumps_succeeded: AtomicU64,
    pumps_failed: AtomicU64,
    protocol_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active_pumps: u64,
    pub pumps_succeeded: u64,
    pub pumps_failed: u64,
    pub protocol_errors: u64,
    pub reconnects: u64,
}

impl StatsSnapshot {
    pub fn pumps_finished(&self) -> u64 {
        self.pumps_succeeded + self.pumps_failed
    }
}

impl std::ops::Add for StatsSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            accepted: self.accepted + rhs.accepted,
            active_pumps: self.active_pumps + rhs.active_pumps,
            pumps_succeeded: self.pumps_succeeded + rhs.pumps_succeeded,
            pumps_failed: self.pumps_failed + rhs.pumps_failed,
            protocol_errors: self.protocol_errors + rhs.protocol_errors,
            reconnects: self.reconnects + rhs.reconnects,
        }
    }
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active_pumps: self.active_pumps.load(Ordering::Relaxed),
            pumps_succeeded: self.pumps_succeeded.load(Ordering::Relaxed),
            pumps_failed: self.pumps_failed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Count a newly accepted connection. The returned guard must travel with
    /// the pump; whichever way the pump ends, dropping it settles the counters.
    pub(crate) fn pump_started(self: &Arc<Self>) -> ActivePump {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active_pumps.fetch_add(1, Ordering::Relaxed);
        ActivePump {
            stats: Arc::clone(self),
            outcome: None,
        }
    }

    fn pump_finished(&self, succeeded: bool, protocol_error: bool) {
        if succeeded {
            self.pumps_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pumps_failed.fetch_add(1, Ordering::Relaxed);
        }
        if protocol_error {
            self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.active_pumps.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnecting(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// One in-flight pump. A pump that panics or is aborted before calling
/// [`ActivePump::finish`] is counted as failed.
#[must_use]
pub(crate) struct ActivePump {
    stats: Arc<SessionStats>,
    outcome: Option<(bool, bool)>,
}

impl ActivePump {
    pub(crate) fn finish(mut self, succeeded: bool, protocol_error: bool) {
        self.outcome = Some((succeeded, protocol_error));
    }
}

impl Drop for ActivePump {
    fn drop(&mut self) {
        let (succeeded, protocol_error) = self.outcome.unwrap_or((false, false));
        self.stats.pump_finished(succeeded, protocol_error);
    }
}
