// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Where relayed byte counts go.
pub trait ByteCounter {
    fn add_received(&self, n: usize);
    fn add_sent(&self, n: usize);
}

/// Per-gateway traffic counters.
///
/// Every field is updated independently from any worker thread; no
/// ordering is implied between fields. A reset replaces the whole
/// `Stats` value rather than zeroing fields in place.
#[derive(Debug)]
pub struct Stats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub http_requests: AtomicU64,
    pub https_requests: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    start_time: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            https_requests: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn http_requests(&self) -> u64 {
        self.http_requests.load(Ordering::Relaxed)
    }

    pub fn https_requests(&self) -> u64 {
        self.https_requests.load(Ordering::Relaxed)
    }

    /// Bytes per second moved in either direction since these counters
    /// were created. Zero until a whole second has elapsed.
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs();
        if elapsed == 0 {
            return 0.0;
        }
        (self.bytes_received() + self.bytes_sent()) as f64 / elapsed as f64
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCounter for Stats {
    fn add_received(&self, n: usize) {
        Stats::add_received(self, n)
    }

    fn add_sent(&self, n: usize) {
        Stats::add_sent(self, n)
    }
}

/// The counters a gateway currently reports.
///
/// A reset swaps in a fresh `Stats`. Bytes counted through this holder
/// land in whichever `Stats` is current at the time of the transfer, so
/// connections opened before a reset keep feeding the live counters.
#[derive(Debug, Default)]
pub struct SharedStats {
    current: RwLock<Arc<Stats>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<Stats> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(Stats::new());
    }
}

impl ByteCounter for SharedStats {
    fn add_received(&self, n: usize) {
        self.current.read().unwrap_or_else(|e| e.into_inner()).add_received(n);
    }

    fn add_sent(&self, n: usize) {
        self.current.read().unwrap_or_else(|e| e.into_inner()).add_sent(n);
    }
}

/// Marks one connection active for as long as the guard lives.
pub(crate) struct ActiveConnection<'a>(&'a Stats);

impl<'a> ActiveConnection<'a> {
    pub(crate) fn new(stats: &'a Stats) -> Self {
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection(stats)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stats_initialization() {
        let stats = Stats::new();
        assert_eq!(stats.total_connections(), 0);
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.bytes_received(), 0);
        assert_eq!(stats.bytes_sent(), 0);
        assert_eq!(stats.throughput(), 0.0);
    }

    #[test]
    fn test_concurrent_counters() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add_received(2);
                        stats.add_sent(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.bytes_received(), 16_000);
        assert_eq!(stats.bytes_sent(), 8_000);
    }

    #[test]
    fn test_active_connection_guard() {
        let stats = Stats::new();
        {
            let _first = ActiveConnection::new(&stats);
            let _second = ActiveConnection::new(&stats);
            assert_eq!(stats.active_connections(), 2);
        }
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_shared_stats_follow_reset() {
        let shared = SharedStats::new();
        let before = shared.current();
        let _active = ActiveConnection::new(&before);
        shared.add_received(10);
        shared.add_sent(4);
        assert_eq!(before.bytes_received(), 10);

        shared.reset();
        shared.add_received(7);
        shared.add_sent(3);
        let after = shared.current();
        assert_eq!(after.bytes_received(), 7);
        assert_eq!(after.bytes_sent(), 3);
        assert_eq!(after.active_connections(), 0);
        assert_eq!(before.bytes_received(), 10);
        assert_eq!(before.active_connections(), 1);
    }
}
