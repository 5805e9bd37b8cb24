// src/load_balancer/random.rs
use super::stats::StatsTable;
use super::Rule;
use crate::upstream::{PoolSnapshot, Server};
use rand::seq::SliceRandom;

pub struct RandomRule;

impl Rule for RandomRule {
    fn choose(&self, _key: Option<&str>, pool: &PoolSnapshot, _stats: &StatsTable) -> Option<Server> {
        pool.servers.choose(&mut rand::thread_rng()).cloned()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
