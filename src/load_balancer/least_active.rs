// src/load_balancer/least_active.rs
use super::stats::StatsTable;
use super::Rule;
use crate::upstream::{PoolSnapshot, Server};

/// Picks the server with the fewest in-flight requests; ties go to the
/// earlier server in the pool.
pub struct LeastActiveRule;

impl Rule for LeastActiveRule {
    fn choose(&self, _key: Option<&str>, pool: &PoolSnapshot, stats: &StatsTable) -> Option<Server> {
        pool.servers
            .iter()
            .enumerate()
            .min_by_key(|(index, server)| {
                let active = stats.get(server).map(|s| s.active_requests()).unwrap_or(0);
                (active, *index)
            })
            .map(|(_, server)| server.clone())
    }

    fn name(&self) -> &'static str {
        "least_active"
    }
}
