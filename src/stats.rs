//! Network statistics
//!
//! Each transport owns one `NetworkStatistics` of lock-free counters. A
//! server that runs several transports reports their sum through
//! `ServerNetworkStatistics`, which never writes.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Anything that can report a statistics snapshot
pub trait StatisticsSource: Send + Sync {
    fn snapshot(&self) -> NetworkStatisticsSnapshot;
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStatisticsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub sessions_connected: u64,
    pub sessions_disconnected: u64,
}

impl NetworkStatisticsSnapshot {
    /// Sessions currently open
    pub fn sessions_active(&self) -> u64 {
        self.sessions_connected.saturating_sub(self.sessions_disconnected)
    }
}

impl Add for NetworkStatisticsSnapshot {
    type Output = NetworkStatisticsSnapshot;

    fn add(self, rhs: Self) -> Self {
        NetworkStatisticsSnapshot {
            bytes_sent: self.bytes_sent + rhs.bytes_sent,
            bytes_received: self.bytes_received + rhs.bytes_received,
            packets_sent: self.packets_sent + rhs.packets_sent,
            packets_received: self.packets_received + rhs.packets_received,
            sessions_connected: self.sessions_connected + rhs.sessions_connected,
            sessions_disconnected: self.sessions_disconnected + rhs.sessions_disconnected,
        }
    }
}

/// Counters of one transport
#[derive(Debug, Default)]
pub struct NetworkStatistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    sessions_connected: AtomicU64,
    sessions_disconnected: AtomicU64,
}

impl NetworkStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one outgoing packet of `bytes`
    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one incoming packet of `bytes`
    pub fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_session_connected(&self) {
        self.sessions_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_session_disconnected(&self) {
        self.sessions_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn sessions_connected(&self) -> u64 {
        self.sessions_connected.load(Ordering::Relaxed)
    }

    pub fn sessions_disconnected(&self) -> u64 {
        self.sessions_disconnected.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.bytes_sent,
            &self.bytes_received,
            &self.packets_sent,
            &self.packets_received,
            &self.sessions_connected,
            &self.sessions_disconnected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> NetworkStatisticsSnapshot {
        NetworkStatisticsSnapshot {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            packets_sent: self.packets_sent(),
            packets_received: self.packets_received(),
            sessions_connected: self.sessions_connected(),
            sessions_disconnected: self.sessions_disconnected(),
        }
    }
}

impl StatisticsSource for NetworkStatistics {
    fn snapshot(&self) -> NetworkStatisticsSnapshot {
        NetworkStatistics::snapshot(self)
    }
}

/// Read-only sum over the statistics of several transports
#[derive(Clone, Default)]
pub struct ServerNetworkStatistics {
    sources: Vec<Arc<dyn StatisticsSource>>,
}

impl ServerNetworkStatistics {
    pub fn new(sources: Vec<Arc<dyn StatisticsSource>>) -> Self {
        ServerNetworkStatistics { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.snapshot().bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.snapshot().bytes_received
    }
}

impl StatisticsSource for ServerNetworkStatistics {
    fn snapshot(&self) -> NetworkStatisticsSnapshot {
        self.sources
            .iter()
            .map(|source| source.snapshot())
            .fold(NetworkStatisticsSnapshot::default(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counters() {
        let stats = NetworkStatistics::new();
        stats.add_sent(100);
        stats.add_sent(20);
        stats.add_received(7);
        stats.add_session_connected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 120);
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_received, 7);
        assert_eq!(snapshot.packets_received, 1);
        assert_eq!(snapshot.sessions_active(), 1);

        stats.reset();
        assert_eq!(stats.snapshot(), NetworkStatisticsSnapshot::default());
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(NetworkStatistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add_received(3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.packets_received(), 8000);
        assert_eq!(stats.bytes_received(), 24000);
    }

    #[test]
    fn test_server_aggregate_is_sum() {
        let tcp = Arc::new(NetworkStatistics::new());
        let udp = Arc::new(NetworkStatistics::new());
        tcp.add_sent(10);
        udp.add_sent(5);
        udp.add_received(1);

        let sources: Vec<Arc<dyn StatisticsSource>> = vec![tcp.clone(), udp.clone()];
        let server = ServerNetworkStatistics::new(sources);
        assert_eq!(server.bytes_sent(), 15);
        assert_eq!(server.snapshot().packets_sent, 2);

        // Nested aggregates compose
        let nested: Vec<Arc<dyn StatisticsSource>> = vec![Arc::new(server), tcp];
        let group = ServerNetworkStatistics::new(nested);
        assert_eq!(group.bytes_sent(), 25);
        assert_eq!(group.bytes_received(), 1);
    }
}
