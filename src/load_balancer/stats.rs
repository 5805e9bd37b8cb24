// src/load_balancer/stats.rs
use crate::upstream::{PoolSnapshot, Server};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ServerStats {
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    completed_requests: AtomicU64,
    total_latency_ms: AtomicU64,
    last_latency_ms: AtomicU64,
    last_failure: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            completed_requests: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub fn record_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_success(&self, latency: Duration) {
        self.finish(latency);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.finish(latency);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some((Instant::now(), Utc::now()));
    }

    /// Dispatch ended without an outcome, e.g. the caller went away.
    pub fn record_cancelled(&self) {
        self.decrement_active();
    }

    fn finish(&self, latency: Duration) {
        let millis = latency.as_millis().min(u64::MAX as u128) as u64;
        self.decrement_active();
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(millis, Ordering::Relaxed);
        self.last_latency_ms.store(millis, Ordering::Relaxed);
    }

    // Saturating, so an unbalanced finish can never drive the count below zero.
    fn decrement_active(&self) {
        let _ = self
            .active_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Mean latency of completed calls, `None` before the first one.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let completed = self.completed_requests.load(Ordering::Relaxed);
        if completed == 0 {
            return None;
        }
        Some(self.total_latency_ms.load(Ordering::Relaxed) as f64 / completed as f64)
    }

    pub fn since_last_failure(&self) -> Option<Duration> {
        let last = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        last.map(|(at, _)| at.elapsed())
    }

    pub fn snapshot(&self, server: &Server) -> ServerStatsSnapshot {
        let last_failure_at = self
            .last_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|(_, wall)| wall);

        ServerStatsSnapshot {
            server: server.clone(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests(),
            consecutive_failures: self.consecutive_failures(),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            last_failure_at,
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of one server's counters, for export.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    pub server: Server,
    pub total_requests: u64,
    pub active_requests: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_latency_ms: u64,
    pub average_latency_ms: Option<f64>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Per-server stats keyed by identity. Entries appear on first reference.
#[derive(Debug, Default)]
pub struct StatsTable {
    entries: DashMap<Server, Arc<ServerStats>>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server: &Server) -> Option<Arc<ServerStats>> {
        self.entries.get(server).map(|entry| entry.value().clone())
    }

    pub fn get_or_create(&self, server: &Server) -> Arc<ServerStats> {
        self.entries
            .entry(server.clone())
            .or_insert_with(|| Arc::new(ServerStats::new()))
            .clone()
    }

    /// Drop entries for servers that are no longer in `pool`.
    pub fn retain_pool(&self, pool: &PoolSnapshot) {
        self.entries.retain(|server, _| pool.contains(server));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_count_never_negative() {
        let stats = ServerStats::new();
        stats.record_cancelled();
        stats.record_success(Duration::from_millis(1));
        assert_eq!(stats.active_requests(), 0);

        stats.record_start();
        assert_eq!(stats.active_requests(), 1);
        stats.record_failure(Duration::from_millis(5));
        assert_eq!(stats.active_requests(), 0);
    }

    #[test]
    fn test_failure_and_success_accounting() {
        let stats = ServerStats::new();
        for _ in 0..3 {
            stats.record_start();
            stats.record_failure(Duration::from_millis(30));
        }
        assert_eq!(stats.consecutive_failures(), 3);
        assert!(stats.since_last_failure().is_some());

        stats.record_start();
        stats.record_success(Duration::from_millis(10));
        assert_eq!(stats.consecutive_failures(), 0);

        let snap = stats.snapshot(&Server::new("a", 1));
        assert_eq!(snap.total_requests, 4);
        assert_eq!(snap.total_failures, 3);
        assert_eq!(snap.last_latency_ms, 10);
        assert_eq!(snap.average_latency_ms, Some(25.0));
        assert!(snap.last_failure_at.is_some());
    }

    #[test]
    fn test_retain_pool_prunes_departed_servers() {
        let table = StatsTable::new();
        let a = Server::new("a", 1);
        let b = Server::new("b", 1);
        table.get_or_create(&a);
        table.get_or_create(&b);

        table.retain_pool(&PoolSnapshot {
            generation: 1,
            servers: vec![b.clone()],
        });
        assert!(table.get(&a).is_none());
        assert!(table.get(&b).is_some());
        assert_eq!(table.len(), 1);
    }
}
