// src/load_balancer/algorithm.rs
use super::stats::StatsTable;
use crate::upstream::{PoolSnapshot, Server};

/// Selection policy. Rules see an immutable snapshot and read-only stats;
/// any cursor state they keep is their own.
pub trait Rule: Send + Sync {
    fn choose(&self, key: Option<&str>, pool: &PoolSnapshot, stats: &StatsTable) -> Option<Server>;

    fn name(&self) -> &'static str;
}
