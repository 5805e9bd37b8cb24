//
// src/upstream/pool.rs
//

use super::refresh::ServerListSource;
use super::server::Server;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Immutable view of a pool at one point in time.
///
/// `generation` increases on every replace, so selection rules can tell a
/// new list apart from an identical-length old one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub servers: Vec<Server>,
}

impl PoolSnapshot {
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, server: &Server) -> bool {
        self.servers.contains(server)
    }
}

/// Candidate servers for one named target.
pub struct ServerPool {
    target: String,
    current: ArcSwap<PoolSnapshot>,
}

impl ServerPool {
    pub fn new(target: impl Into<String>, servers: Vec<Server>) -> Self {
        Self {
            target: target.into(),
            current: ArcSwap::from_pointee(PoolSnapshot {
                generation: 0,
                servers,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn list(&self) -> Arc<PoolSnapshot> {
        self.current.load_full()
    }

    /// Swap in a complete new list. Readers see either the old snapshot or
    /// the new one, never a mix.
    pub fn replace(&self, servers: Vec<Server>) -> u64 {
        let previous = self.current.rcu(|current| PoolSnapshot {
            generation: current.generation + 1,
            servers: servers.clone(),
        });
        let generation = previous.generation + 1;

        info!(
            target_name = %self.target,
            generation,
            servers = servers.len(),
            "Replaced server list"
        );
        generation
    }

    /// Replace only when the list actually changed. Returns true on swap.
    pub fn replace_if_changed(&self, servers: Vec<Server>) -> bool {
        if self.current.load().servers == servers {
            debug!(target_name = %self.target, "Server list unchanged");
            return false;
        }
        self.replace(servers);
        true
    }

    /// Poll `source` every `period`, starting immediately. A failed fetch
    /// keeps the previous snapshot in effect.
    pub fn subscribe(
        self: &Arc<Self>,
        source: Arc<dyn ServerListSource>,
        period: Duration,
    ) -> RefreshHandle {
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                target_name = %pool.target,
                source = %source.describe(),
                "Starting server list refresh with interval: {:?}",
                period
            );

            loop {
                ticker.tick().await;
                pool.refresh_from(source.as_ref()).await;
            }
        });
        RefreshHandle { task }
    }

    /// Push-driven refresh: every value published on `updates` replaces the
    /// list. The task ends when the sender is dropped.
    pub fn subscribe_push(self: &Arc<Self>, mut updates: watch::Receiver<Vec<Server>>) -> RefreshHandle {
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let servers = updates.borrow_and_update().clone();
                pool.replace_if_changed(servers);
            }
            debug!(target_name = %pool.target, "Push source closed");
        });
        RefreshHandle { task }
    }

    pub async fn refresh_from(&self, source: &dyn ServerListSource) -> bool {
        match source.fetch().await {
            Ok(servers) => self.replace_if_changed(servers),
            Err(e) => {
                warn!(
                    target_name = %self.target,
                    source = %source.describe(),
                    "Server list refresh failed, keeping previous list: {:#}",
                    e
                );
                false
            }
        }
    }
}

/// Owns a background refresh task and aborts it when dropped.
#[derive(Debug)]
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::refresh::StaticSource;
    use async_trait::async_trait;

    fn servers(names: &[&str]) -> Vec<Server> {
        names.iter().map(|n| Server::new(*n, 80)).collect()
    }

    struct FailingSource;

    #[async_trait]
    impl ServerListSource for FailingSource {
        async fn fetch(&self) -> anyhow::Result<Vec<Server>> {
            anyhow::bail!("registry unreachable")
        }

        fn describe(&self) -> String {
            "failing".into()
        }
    }

    #[test]
    fn test_replace_bumps_generation() {
        let pool = ServerPool::new("svc", servers(&["a", "b"]));
        let before = pool.list();
        assert_eq!(before.generation, 0);

        pool.replace(servers(&["c"]));
        let after = pool.list();
        assert_eq!(after.generation, 1);
        assert_eq!(after.servers, servers(&["c"]));
        // the old snapshot is untouched
        assert_eq!(before.servers, servers(&["a", "b"]));
    }

    #[test]
    fn test_replace_if_changed_skips_identical_list() {
        let pool = ServerPool::new("svc", servers(&["a"]));
        assert!(!pool.replace_if_changed(servers(&["a"])));
        assert_eq!(pool.list().generation, 0);
        assert!(pool.replace_if_changed(servers(&["a", "b"])));
        assert_eq!(pool.list().generation, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let pool = ServerPool::new("svc", servers(&["a", "b"]));
        assert!(!pool.refresh_from(&FailingSource).await);
        assert_eq!(pool.list().servers, servers(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_empty_refresh_result_is_valid() {
        let pool = ServerPool::new("svc", servers(&["a"]));
        assert!(pool.refresh_from(&StaticSource::new(Vec::new())).await);
        assert!(pool.list().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_applies_first_fetch_immediately() {
        let pool = Arc::new(ServerPool::new("svc", Vec::new()));
        let source = Arc::new(StaticSource::new(servers(&["x"])));
        let handle = pool.subscribe(source, Duration::from_secs(3600));

        for _ in 0..50 {
            if !pool.list().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.list().servers, servers(&["x"]));
        drop(handle);
    }

    #[tokio::test]
    async fn test_subscribe_push() {
        let pool = Arc::new(ServerPool::new("svc", servers(&["a"])));
        let (tx, rx) = watch::channel(servers(&["a"]));
        let _handle = pool.subscribe_push(rx);

        tx.send(servers(&["www.aaa.com", "www.baidu.com"])).unwrap();
        for _ in 0..50 {
            if pool.list().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.list().servers, servers(&["www.aaa.com", "www.baidu.com"]));
    }
}
