//! Per-service counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for one proxied service.
#[derive(Debug, Default)]
pub struct ServiceStats {
    /// Total connections (or new datagram clients) accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently forwarding or waiting on a wake.
    pub connections_active: AtomicU64,
    /// Connections finished, for any reason.
    pub connections_closed: AtomicU64,
    /// Connections or datagrams rejected after a wake timeout.
    pub connections_rejected: AtomicU64,
    /// Datagrams dropped because the client cap was reached.
    pub datagrams_dropped: AtomicU64,
    /// Forwarding sessions ended by an I/O error.
    pub forward_errors: AtomicU64,
    /// Bytes proxied to the target.
    pub bytes_to_target: AtomicU64,
    /// Bytes proxied from the target.
    pub bytes_from_target: AtomicU64,
    /// Datagrams proxied to the target.
    pub datagrams_to_target: AtomicU64,
    /// Datagrams proxied from the target.
    pub datagrams_from_target: AtomicU64,
    /// Wake episodes started.
    pub wake_episodes: AtomicU64,
    /// Magic packets handed to the network.
    pub wake_packets_sent: AtomicU64,
    /// Wake episodes that ended without the target becoming reachable.
    pub wake_timeouts: AtomicU64,
}

impl ServiceStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            bytes_to_target: self.bytes_to_target.load(Ordering::Relaxed),
            bytes_from_target: self.bytes_from_target.load(Ordering::Relaxed),
            datagrams_to_target: self.datagrams_to_target.load(Ordering::Relaxed),
            datagrams_from_target: self.datagrams_from_target.load(Ordering::Relaxed),
            wake_episodes: self.wake_episodes.load(Ordering::Relaxed),
            wake_packets_sent: self.wake_packets_sent.load(Ordering::Relaxed),
            wake_timeouts: self.wake_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServiceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub datagrams_dropped: u64,
    pub forward_errors: u64,
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
    pub datagrams_to_target: u64,
    pub datagrams_from_target: u64,
    pub wake_episodes: u64,
    pub wake_packets_sent: u64,
    pub wake_timeouts: u64,
}

/// Tracks one active connection; closing is recorded on drop so that
/// aborted sessions are counted too.
pub(crate) struct ActiveGuard {
    stats: Arc<ServiceStats>,
}

impl ActiveGuard {
    pub(crate) fn new(stats: &Arc<ServiceStats>) -> Self {
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self {
            stats: Arc::clone(stats),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}
