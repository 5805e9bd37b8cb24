// src/load_balancer/response_time.rs
use super::stats::StatsTable;
use super::Rule;
use crate::upstream::{PoolSnapshot, Server};

/// Picks the server with the lowest average latency. Servers without any
/// completed call sort first so they get probed.
pub struct ResponseTimeRule;

impl Rule for ResponseTimeRule {
    fn choose(&self, _key: Option<&str>, pool: &PoolSnapshot, stats: &StatsTable) -> Option<Server> {
        let mut best: Option<(&Server, f64)> = None;
        for server in &pool.servers {
            let average = stats
                .get(server)
                .and_then(|s| s.average_latency_ms())
                .unwrap_or(0.0);
            match best {
                Some((_, current)) if current <= average => {}
                _ => best = Some((server, average)),
            }
        }
        best.map(|(server, _)| server.clone())
    }

    fn name(&self) -> &'static str {
        "response_time"
    }
}
