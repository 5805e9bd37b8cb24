// src/load_balancer/balancer.rs
use super::stats::{ServerStats, ServerStatsSnapshot, StatsTable};
use super::Rule;
use crate::upstream::{PoolSnapshot, RefreshHandle, Server, ServerPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadBalancerError {
    #[error("no server available for target '{0}'")]
    NoServerAvailable(String),
}

/// Client-side balancer for one named target.
pub struct LoadBalancer {
    name: String,
    pool: Arc<ServerPool>,
    stats: StatsTable,
    rule: Box<dyn Rule>,
    pruned_generation: AtomicU64,
    refresh: Mutex<Option<RefreshHandle>>,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, servers: Vec<Server>, rule: Box<dyn Rule>) -> Self {
        let name = name.into();
        Self {
            pool: Arc::new(ServerPool::new(name.clone(), servers)),
            name,
            stats: StatsTable::new(),
            rule,
            pruned_generation: AtomicU64::new(0),
            refresh: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule_name(&self) -> &'static str {
        self.rule.name()
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn replace_servers(&self, servers: Vec<Server>) {
        self.pool.replace(servers);
        self.prune_stats();
    }

    /// Keep the refresh task alive for as long as this balancer exists.
    pub fn attach_refresh(&self, handle: RefreshHandle) {
        let mut slot = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    /// Abort the refresh task, if any. The current snapshot stays.
    pub fn stop_refresh(&self) {
        let handle = self.refresh.lock().unwrap_or_else(|e| e.into_inner()).take();
        if handle.is_some() {
            tracing::debug!(target_name = %self.name, "Stopped server list refresh");
        }
    }

    pub fn choose_server(&self, hint: Option<&str>) -> Result<Server, LoadBalancerError> {
        self.prune_stats();
        let snapshot = self.pool.list();
        match self.rule.choose(hint, &snapshot, &self.stats) {
            Some(server) => {
                tracing::debug!(target_name = %self.name, %server, rule = self.rule.name(), "Chose server");
                Ok(server)
            }
            None => Err(LoadBalancerError::NoServerAvailable(self.name.clone())),
        }
    }

    pub fn mark_start(&self, server: &Server) -> DispatchGuard {
        let stats = self.stats.get_or_create(server);
        stats.record_start();
        DispatchGuard {
            stats: Some(stats),
        }
    }

    pub fn mark_success(&self, server: &Server, latency: Duration) {
        if let Some(stats) = self.stats.get(server) {
            stats.record_success(latency);
        }
    }

    pub fn mark_failure(&self, server: &Server, latency: Duration) {
        if let Some(stats) = self.stats.get(server) {
            stats.record_failure(latency);
        }
    }

    /// Counters for every server currently in the pool, in pool order.
    pub fn stats(&self) -> Vec<ServerStatsSnapshot> {
        self.prune_stats();
        let snapshot = self.pool.list();
        snapshot
            .servers
            .iter()
            .map(|server| match self.stats.get(server) {
                Some(stats) => stats.snapshot(server),
                None => ServerStats::new().snapshot(server),
            })
            .collect()
    }

    pub fn server_stats(&self, server: &Server) -> Option<ServerStatsSnapshot> {
        self.stats.get(server).map(|stats| stats.snapshot(server))
    }

    fn prune_stats(&self) {
        self.prune_for(&self.pool.list());
    }

    /// Drop stats for servers outside `snapshot`, unless a newer generation
    /// has already been pruned.
    fn prune_for(&self, snapshot: &PoolSnapshot) {
        let previous = self
            .pruned_generation
            .fetch_max(snapshot.generation, Ordering::AcqRel);
        if previous < snapshot.generation {
            self.stats.retain_pool(snapshot);
        }
    }
}

/// Balances `mark_start` for one dispatch. Finish it with `success` or
/// `failure`; dropping it unfinished only releases the active slot.
#[must_use = "an unfinished dispatch guard counts as a cancelled call"]
pub struct DispatchGuard {
    stats: Option<Arc<ServerStats>>,
}

impl DispatchGuard {
    pub fn success(mut self, latency: Duration) {
        if let Some(stats) = self.stats.take() {
            stats.record_success(latency);
        }
    }

    pub fn failure(mut self, latency: Duration) {
        if let Some(stats) = self.stats.take() {
            stats.record_failure(latency);
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(stats) = self.stats.take() {
            stats.record_cancelled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::RoundRobinRule;

    fn balancer(names: &[&str]) -> LoadBalancer {
        let servers = names.iter().map(|n| Server::new(*n, 80)).collect();
        LoadBalancer::new("svc", servers, Box::new(RoundRobinRule::new()))
    }

    #[test]
    fn test_empty_pool_reports_no_server() {
        let lb = balancer(&[]);
        assert_eq!(
            lb.choose_server(None),
            Err(LoadBalancerError::NoServerAvailable("svc".into()))
        );
    }

    #[test]
    fn test_guard_balances_active_requests() {
        let lb = balancer(&["a"]);
        let server = lb.choose_server(None).unwrap();

        let guard = lb.mark_start(&server);
        assert_eq!(lb.server_stats(&server).unwrap().active_requests, 1);
        drop(guard);
        let snap = lb.server_stats(&server).unwrap();
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.total_failures, 0);

        lb.mark_start(&server).failure(Duration::from_millis(3));
        let snap = lb.server_stats(&server).unwrap();
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[test]
    fn test_mark_calls_update_stats() {
        let lb = balancer(&["a"]);
        let server = Server::new("a", 80);
        let _ = lb.mark_start(&server);
        lb.mark_start(&server).success(Duration::from_millis(7));
        lb.mark_failure(&server, Duration::from_millis(9));

        let snap = &lb.stats()[0];
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.last_latency_ms, 9);

        lb.mark_success(&server, Duration::from_millis(1));
        assert_eq!(lb.stats()[0].consecutive_failures, 0);
    }

    #[test]
    fn test_removed_server_stats_are_pruned() {
        let lb = balancer(&["a", "b"]);
        let a = Server::new("a", 80);
        lb.mark_start(&a).success(Duration::from_millis(1));
        assert!(lb.server_stats(&a).is_some());

        lb.replace_servers(vec![Server::new("b", 80)]);
        assert!(lb.server_stats(&a).is_none());
        let stats = lb.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].server, Server::new("b", 80));
    }

    #[test]
    fn test_stale_snapshot_does_not_prune_newer_pool() {
        let lb = balancer(&["a"]);
        let stale = lb.pool().list();
        assert_eq!(stale.generation, 0);

        lb.replace_servers(vec![Server::new("a", 80), Server::new("b", 80)]);
        let b = Server::new("b", 80);
        lb.mark_start(&b).success(Duration::from_millis(2));

        lb.prune_for(&stale);
        assert_eq!(lb.server_stats(&b).unwrap().total_requests, 1);

        lb.replace_servers(vec![Server::new("a", 80)]);
        assert!(lb.server_stats(&b).is_none());
    }
}
