//! Per-instance statistics.
//!
//! Every proxy instance owns one registry. Counters only increase; a fresh
//! instance is the only way to start from zero.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FaultDirection;

/// Statistics for a proxy instance.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    connections_accepted: AtomicU64,
    /// Sessions currently relaying or dialing.
    sessions_active: AtomicU64,
    /// Faults injected into bytes flowing to the client.
    read_faults: AtomicU64,
    /// Faults injected into bytes flowing from the client.
    write_faults: AtomicU64,
    /// Failed dials to the target.
    dial_failures: AtomicU64,
    /// Bytes relayed to the target.
    bytes_to_target: AtomicU64,
    /// Bytes relayed from the target.
    bytes_from_target: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub sessions_active: u64,
    pub read_faults: u64,
    pub write_faults: u64,
    pub dial_failures: u64,
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
}

impl StatsSnapshot {
    /// Injected faults plus dial failures, per accepted connection.
    ///
    /// Zero when nothing has been accepted yet.
    pub fn failure_ratio(&self) -> f64 {
        if self.connections_accepted == 0 {
            return 0.0;
        }
        let failures = self.read_faults + self.write_faults + self.dial_failures;
        failures as f64 / self.connections_accepted as f64
    }
}

impl ProxyStats {
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn read_faults(&self) -> u64 {
        self.read_faults.load(Ordering::Relaxed)
    }

    pub fn write_faults(&self) -> u64 {
        self.write_faults.load(Ordering::Relaxed)
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_to_target(&self) -> u64 {
        self.bytes_to_target.load(Ordering::Relaxed)
    }

    pub fn bytes_from_target(&self) -> u64 {
        self.bytes_from_target.load(Ordering::Relaxed)
    }

    /// `(read faults + write faults + dial failures) / accepted connections`.
    pub fn failure_ratio(&self) -> f64 {
        self.snapshot().failure_ratio()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted(),
            sessions_active: self.sessions_active(),
            read_faults: self.read_faults(),
            write_faults: self.write_faults(),
            dial_failures: self.dial_failures(),
            bytes_to_target: self.bytes_to_target(),
            bytes_from_target: self.bytes_from_target(),
        }
    }

    pub(crate) fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self, direction: FaultDirection) {
        let counter = match direction {
            FaultDirection::Read => &self.read_faults,
            FaultDirection::Write => &self.write_faults,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_started(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_finished(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_to_target_counter(&self) -> &AtomicU64 {
        &self.bytes_to_target
    }

    pub(crate) fn bytes_from_target_counter(&self) -> &AtomicU64 {
        &self.bytes_from_target
    }
}
