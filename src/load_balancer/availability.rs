// src/load_balancer/availability.rs
use super::stats::StatsTable;
use super::Rule;
use crate::upstream::{PoolSnapshot, Server};
use std::time::Duration;
use tracing::debug;

/// Skips servers that keep failing, then lets them back in once the
/// cool-down has passed since their last failure.
///
/// A readmitted server stays at or above the threshold until it succeeds,
/// so one more failure takes it out again for a full cool-down.
pub struct AvailabilityFilteringRule {
    inner: Box<dyn Rule>,
    threshold: u32,
    cooldown: Duration,
}

impl AvailabilityFilteringRule {
    pub fn new(inner: Box<dyn Rule>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn is_available(&self, server: &Server, stats: &StatsTable) -> bool {
        let Some(entry) = stats.get(server) else {
            return true;
        };
        if entry.consecutive_failures() < self.threshold {
            return true;
        }
        match entry.since_last_failure() {
            Some(elapsed) => elapsed >= self.cooldown,
            None => true,
        }
    }
}

impl Rule for AvailabilityFilteringRule {
    fn choose(&self, key: Option<&str>, pool: &PoolSnapshot, stats: &StatsTable) -> Option<Server> {
        let available: Vec<Server> = pool
            .servers
            .iter()
            .filter(|server| self.is_available(server, stats))
            .cloned()
            .collect();

        if available.len() < pool.len() {
            debug!(
                "Availability filter excluded {} of {} servers",
                pool.len() - available.len(),
                pool.len()
            );
        }

        let filtered = PoolSnapshot {
            generation: pool.generation,
            servers: available,
        };
        self.inner.choose(key, &filtered, stats)
    }

    fn name(&self) -> &'static str {
        "availability_filtering"
    }
}
