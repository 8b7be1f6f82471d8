//! Per-protocol session counters.
//!
//! Counters accumulate across sessions and are only cleared by an explicit
//! [`SessionStats::reset`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ProtocolStats {
    total: AtomicU64,
    recent: AtomicU64,
    received: AtomicU64,
    sent: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of a [`ProtocolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub recent: u64,
    pub received: u64,
    pub sent: u64,
    pub deleted: u64,
    pub failed: u64,
}

impl ProtocolStats {
    /// Add the mailbox (or queue) size seen at the start of a session.
    pub fn record_seen(&self, total: u64, recent: u64) {
        self.total.fetch_add(total, Ordering::Relaxed);
        self.recent.fetch_add(recent, Ordering::Relaxed);
    }

    pub fn add_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            recent: self.recent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total,
            &self.recent,
            &self.received,
            &self.sent,
            &self.deleted,
            &self.failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub receive: ProtocolStats,
    pub send: ProtocolStats,
}

impl SessionStats {
    pub fn reset(&self) {
        self.receive.reset();
        self.send.reset();
    }
}
