// src/load_balancer/mod.rs
mod algorithm;
mod availability;
mod balancer;
mod least_active;
mod random;
mod registry;
mod response_time;
mod round_robin;
mod stats;

pub use algorithm::Rule;
pub use availability::AvailabilityFilteringRule;
pub use balancer::{DispatchGuard, LoadBalancer, LoadBalancerError};
pub use least_active::LeastActiveRule;
pub use random::RandomRule;
pub use registry::LoadBalancerRegistry;
pub use response_time::ResponseTimeRule;
pub use round_robin::RoundRobinRule;
pub use stats::{ServerStats, ServerStatsSnapshot, StatsTable};
pub use crate::config::RuleKind;

use crate::config::AvailabilityConfig;

pub fn create_rule(kind: RuleKind, availability: &AvailabilityConfig) -> Box<dyn Rule> {
    let base: Box<dyn Rule> = match kind {
        RuleKind::RoundRobin => Box::new(RoundRobinRule::new()),
        RuleKind::LeastActive => Box::new(LeastActiveRule),
        RuleKind::ResponseTime => Box::new(ResponseTimeRule),
        RuleKind::Random => Box::new(RandomRule),
    };

    if availability.enabled {
        Box::new(AvailabilityFilteringRule::new(
            base,
            availability.threshold,
            availability.cooldown(),
        ))
    } else {
        base
    }
}
