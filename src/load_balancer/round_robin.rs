// src/load_balancer/round_robin.rs
use super::stats::StatsTable;
use super::Rule;
use crate::upstream::{PoolSnapshot, Server};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Cursor {
    generation: u64,
    len: usize,
    next: usize,
}

pub struct RoundRobinRule {
    cursor: Mutex<Cursor>,
}

impl RoundRobinRule {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(Cursor::default()),
        }
    }
}

impl Default for RoundRobinRule {
    fn default() -> Self {
        Self::new()
    }
}

impl Rule for RoundRobinRule {
    fn choose(&self, _key: Option<&str>, pool: &PoolSnapshot, _stats: &StatsTable) -> Option<Server> {
        if pool.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        // A new list starts again from its first element.
        if cursor.generation != pool.generation || cursor.len != pool.len() {
            cursor.generation = pool.generation;
            cursor.len = pool.len();
            cursor.next = 0;
        }

        let index = cursor.next % pool.len();
        cursor.next = (index + 1) % pool.len();
        Some(pool.servers[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
