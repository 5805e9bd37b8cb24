// src/load_balancer/registry.rs
use super::balancer::LoadBalancer;
use super::stats::ServerStatsSnapshot;
use super::create_rule;
use crate::config::{Config, RefreshKind, TargetConfig};
use crate::upstream::{FileSource, HttpSource, ServerListSource};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Named load balancers, one per target.
#[derive(Default)]
pub struct LoadBalancerRegistry {
    balancers: DashMap<String, Arc<LoadBalancer>>,
    schemes: DashMap<String, &'static str>,
}

impl LoadBalancerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured target. Refresh tasks are spawned, so this
    /// must run inside a tokio runtime when any target polls.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new();
        for target in &config.targets {
            registry.create(target, config.outbound.timeout())?;
        }
        Ok(registry)
    }

    pub fn create(&self, target: &TargetConfig, fetch_timeout: Duration) -> Result<Arc<LoadBalancer>> {
        let servers = target
            .parsed_servers()
            .with_context(|| format!("Invalid servers for target '{}'", target.name))?;
        let rule = create_rule(target.rule, &target.availability);
        let balancer = Arc::new(LoadBalancer::new(target.name.clone(), servers, rule));

        let source: Option<Arc<dyn ServerListSource>> = match target.refresh.kind {
            RefreshKind::Static => None,
            RefreshKind::File => {
                let path = target
                    .refresh
                    .path
                    .clone()
                    .context("file refresh requires a path")?;
                Some(Arc::new(FileSource::new(path)))
            }
            RefreshKind::Http => {
                let url = target
                    .refresh
                    .url
                    .clone()
                    .context("http refresh requires a url")?;
                Some(Arc::new(HttpSource::new(url, fetch_timeout)?))
            }
        };
        if let Some(source) = source {
            let handle = balancer.pool().subscribe(source, target.refresh.interval());
            balancer.attach_refresh(handle);
        }

        info!(
            target_name = %target.name,
            rule = balancer.rule_name(),
            servers = balancer.pool().list().len(),
            "Registered load balancer"
        );
        self.insert(balancer.clone(), target.scheme());
        Ok(balancer)
    }

    pub fn insert(&self, balancer: Arc<LoadBalancer>, scheme: &'static str) {
        let name = balancer.name().to_string();
        self.schemes.insert(name.clone(), scheme);
        self.balancers.insert(name, balancer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadBalancer>> {
        self.balancers.get(name).map(|entry| entry.value().clone())
    }

    /// `http` unless the target was registered as secure.
    pub fn scheme(&self, name: &str) -> &'static str {
        self.schemes.get(name).map(|s| *s.value()).unwrap_or("http")
    }

    /// Remove a target and stop its refresh task. In-flight requests keep
    /// their handle to the balancer.
    pub fn remove(&self, name: &str) -> Option<Arc<LoadBalancer>> {
        self.schemes.remove(name);
        let removed = self.balancers.remove(name).map(|(_, balancer)| balancer);
        if let Some(balancer) = &removed {
            balancer.stop_refresh();
            info!(target_name = %name, "Removed load balancer");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.balancers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }

    /// Read-only export of every target's server stats.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ServerStatsSnapshot>> {
        self.balancers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}
