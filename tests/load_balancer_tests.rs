// tests/load_balancer_tests.rs
use rust_filter_gateway::config::{AvailabilityConfig, RuleKind};
use rust_filter_gateway::load_balancer::{create_rule, LoadBalancer, LoadBalancerError, RoundRobinRule};
use rust_filter_gateway::upstream::{Server, ServerPool, StaticSource};
use std::sync::Arc;
use std::time::Duration;

fn servers(list: &[&str]) -> Vec<Server> {
    list.iter().map(|s| Server::parse(s).unwrap()).collect()
}

fn round_robin(list: &[&str]) -> LoadBalancer {
    LoadBalancer::new("sample-client", servers(list), Box::new(RoundRobinRule::new()))
}

fn next(lb: &LoadBalancer) -> String {
    lb.choose_server(None).unwrap().to_string()
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let lb = round_robin(&["a:80", "b:80", "c:80"]);
    let mut counts = std::collections::HashMap::new();
    for _ in 0..300 {
        *counts.entry(next(&lb)).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 100));
}

#[tokio::test]
async fn test_replace_switches_pool_immediately() {
    let lb = round_robin(&["a:80", "b:80"]);
    assert_eq!(next(&lb), "a:80");
    assert_eq!(next(&lb), "b:80");
    assert_eq!(next(&lb), "a:80");
    assert_eq!(next(&lb), "b:80");

    lb.replace_servers(servers(&["c:80"]));
    assert_eq!(next(&lb), "c:80");
    assert_eq!(next(&lb), "c:80");
}

#[tokio::test]
async fn test_empty_pool_has_no_server() {
    let lb = round_robin(&[]);
    assert_eq!(
        lb.choose_server(None),
        Err(LoadBalancerError::NoServerAvailable("sample-client".to_string()))
    );

    lb.replace_servers(servers(&["a:80"]));
    assert_eq!(next(&lb), "a:80");

    lb.replace_servers(Vec::new());
    assert!(lb.choose_server(None).is_err());
}

#[tokio::test]
async fn test_replace_with_same_length_restarts_cursor() {
    let lb = round_robin(&["a:80", "b:80"]);
    assert_eq!(next(&lb), "a:80");

    lb.replace_servers(servers(&["x:80", "y:80"]));
    assert_eq!(next(&lb), "x:80");
    assert_eq!(next(&lb), "y:80");
}

#[tokio::test]
async fn test_stats_follow_pool_membership() {
    let lb = round_robin(&["a:80", "b:80"]);
    let a = Server::parse("a:80").unwrap();

    let guard = lb.mark_start(&a);
    assert_eq!(lb.stats()[0].active_requests, 1);
    guard.failure(Duration::from_millis(12));

    let stats = lb.stats();
    assert_eq!(stats[0].active_requests, 0);
    assert_eq!(stats[0].total_failures, 1);
    assert_eq!(stats[0].consecutive_failures, 1);
    assert_eq!(stats[1].total_requests, 0);

    lb.replace_servers(servers(&["b:80"]));
    let stats = lb.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].server.to_string(), "b:80");
    assert!(lb.server_stats(&a).is_none());
}

#[tokio::test]
async fn test_cancelled_dispatch_is_not_a_failure() {
    let lb = round_robin(&["a:80"]);
    let a = Server::parse("a:80").unwrap();

    {
        let _guard = lb.mark_start(&a);
        assert_eq!(lb.stats()[0].active_requests, 1);
    }

    let stats = lb.stats();
    assert_eq!(stats[0].active_requests, 0);
    assert_eq!(stats[0].total_failures, 0);
}

#[tokio::test]
async fn test_availability_filter_skips_tripped_server() {
    let availability = AvailabilityConfig {
        enabled: true,
        threshold: 2,
        cooldown_ms: 60_000,
    };
    let lb = LoadBalancer::new(
        "orders",
        servers(&["a:80", "b:80"]),
        create_rule(RuleKind::RoundRobin, &availability),
    );
    let a = Server::parse("a:80").unwrap();
    lb.mark_start(&a).failure(Duration::from_millis(1));
    lb.mark_start(&a).failure(Duration::from_millis(1));

    for _ in 0..4 {
        assert_eq!(next(&lb), "b:80");
    }
}

#[tokio::test]
async fn test_pool_subscription_replaces_servers() {
    let pool = Arc::new(ServerPool::new("sample-client", servers(&["a:80"])));
    let source = Arc::new(StaticSource::new(servers(&["b:80", "c:80"])));
    let _handle = pool.subscribe(source, Duration::from_secs(3600));

    for _ in 0..50 {
        if pool.list().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = pool.list();
    assert_eq!(snapshot.servers, servers(&["b:80", "c:80"]));
    assert!(snapshot.generation > 0);
}
