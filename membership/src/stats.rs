//! Counters owned by a reactor or gossip instance.
//!
//! Each instance carries its own stats; nothing here is process-wide.
//! `report()` logs the counters accumulated since the previous report and
//! resets them.

use {
    log::info,
    std::sync::atomic::{AtomicU64, Ordering},
};

/// A counter that can be drained.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Current value, resetting to zero.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ReactorStats {
    pub accepted: Counter,
    pub connected: Counter,
    pub connect_failures: Counter,
    pub frames_read: Counter,
    pub frames_written: Counter,
    pub bytes_read: Counter,
    pub bytes_written: Counter,
    pub protocol_errors: Counter,
    pub closed: Counter,
    pub poll_wakeups: Counter,
}

impl ReactorStats {
    pub fn report(&self, name: &str) {
        info!(
            "{name} reactor: accepted={} connected={} connect_failures={} frames_read={} \
             frames_written={} bytes_read={} bytes_written={} protocol_errors={} closed={} \
             poll_wakeups={}",
            self.accepted.take(),
            self.connected.take(),
            self.connect_failures.take(),
            self.frames_read.take(),
            self.frames_written.take(),
            self.bytes_read.take(),
            self.bytes_written.take(),
            self.protocol_errors.take(),
            self.closed.take(),
            self.poll_wakeups.take(),
        );
    }
}

#[derive(Debug, Default)]
pub struct GossipStats {
    pub packets_sent: Counter,
    pub packets_received: Counter,
    /// Dropped for a foreign magic number.
    pub packets_foreign: Counter,
    /// Dropped because the peer is being ignored.
    pub packets_ignored: Counter,
    pub malformed_records: Counter,
    pub updates_applied: Counter,
    pub rounds: Counter,
    pub connect_requests: Counter,
}

impl GossipStats {
    pub fn report(&self, name: &str) {
        info!(
            "{name} gossip: rounds={} sent={} received={} foreign={} ignored={} malformed={} \
             updates_applied={} connect_requests={}",
            self.rounds.take(),
            self.packets_sent.take(),
            self.packets_received.take(),
            self.packets_foreign.take(),
            self.packets_ignored.take(),
            self.malformed_records.take(),
            self.updates_applied.take(),
            self.connect_requests.take(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_resets() {
        let stats = ReactorStats::default();
        stats.frames_read.add(3);
        stats.accepted.inc();
        assert_eq!(stats.frames_read.get(), 3);
        stats.report("test");
        assert_eq!(stats.frames_read.get(), 0);
        assert_eq!(stats.accepted.get(), 0);
    }
}
