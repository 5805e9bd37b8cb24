// src/filter/route.rs
//
// Built-in route-phase filter: picks a server through the target's load
// balancer and performs the outbound call.

use super::chain::{Filter, Phase};
use super::context::{RequestContext, RouteTarget};
use crate::config::OutboundConfig;
use crate::error::GatewayError;
use crate::load_balancer::{LoadBalancer, LoadBalancerRegistry};
use crate::metrics::MetricsCollector;
use crate::retry::{RetryDecision, RetryPolicy, RetryStrategy};
use crate::upstream::Server;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST};
use hyper::{Body, Client, HeaderMap, Method, Request, Response, Uri};
use hyper_tls::HttpsConnector;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Copy of `headers` without hop-by-hop headers, headers named in
/// `Connection`, and anything in `extra`.
pub fn forwardable_headers(headers: &HeaderMap, extra: &[HeaderName]) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || listed.iter().any(|token| token == lower)
            || extra.contains(name)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Classification of a finished attempt, for logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    /// The origin answered with a non-2xx status. Passed through as is.
    UpstreamNon2xx,
    Timeout,
    ConnectionFailure,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::UpstreamNon2xx => "non_2xx",
            DispatchOutcome::Timeout => "timeout",
            DispatchOutcome::ConnectionFailure => "connection_failure",
        }
    }
}

struct OutboundRequest {
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    scheme: &'static str,
    target: RouteTarget,
}

struct Dispatched {
    server: Server,
    response: Response<Body>,
}

pub type OutboundClient = Client<HttpsConnector<HttpConnector>>;

pub struct RouteFilter {
    registry: Arc<LoadBalancerRegistry>,
    client: OutboundClient,
    config: OutboundConfig,
    retry: RetryStrategy,
    strip_headers: Vec<HeaderName>,
    permits: DashMap<String, Arc<Semaphore>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RouteFilter {
    pub const ORDER: i32 = 100;

    pub fn new(
        registry: Arc<LoadBalancerRegistry>,
        config: OutboundConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.timeout()));

        let tls = hyper_tls::native_tls::TlsConnector::new().context("Failed to create TLS connector")?;
        let https = HttpsConnector::from((http, tls.into()));

        // hyper never follows redirects; canceled requests are not replayed.
        let client = Client::builder()
            .pool_max_idle_per_host(config.connect_pool_size)
            .retry_canceled_requests(false)
            .build(https);

        let strip_headers = config
            .strip_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                    .with_context(|| format!("invalid strip header '{}'", name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            registry,
            client,
            retry: RetryStrategy::new(RetryPolicy::from_outbound(&config)),
            config,
            strip_headers,
            permits: DashMap::new(),
            metrics,
        })
    }

    fn permits_for(&self, target: &str) -> Arc<Semaphore> {
        self.permits
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.connect_pool_size)))
            .clone()
    }

    fn outbound_request(&self, ctx: &RequestContext, target: RouteTarget) -> OutboundRequest {
        let mut headers = forwardable_headers(&ctx.request.headers, &self.strip_headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        for (name, value) in ctx.origin_request_headers() {
            headers.insert(name.clone(), value.clone());
        }

        OutboundRequest {
            method: ctx.request.method.clone(),
            headers,
            body: ctx.request.body.clone(),
            scheme: self.registry.scheme(&target.upstream),
            target,
        }
    }

    /// One attempt: choose, dispatch, account. Never holds a lock across
    /// the network call.
    async fn attempt(&self, lb: &LoadBalancer, outbound: &OutboundRequest) -> Result<Dispatched, GatewayError> {
        let upstream = outbound.target.upstream.as_str();
        let server = lb
            .choose_server(Some(outbound.target.path_and_query.as_str()))
            .map_err(|_| GatewayError::NoServerAvailable {
                target: upstream.to_string(),
            })?;

        let uri: Uri = format!(
            "{}://{}{}",
            outbound.scheme,
            server.authority(),
            outbound.target.path_and_query
        )
        .parse()
        .map_err(|e| GatewayError::BadRequest(format!("unroutable path: {}", e)))?;

        let mut request = Request::new(Body::from(outbound.body.clone()));
        *request.method_mut() = outbound.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = outbound.headers.clone();
        if let Ok(host) = HeaderValue::from_str(&server.authority()) {
            request.headers_mut().insert(HOST, host);
        }

        let permits = self.permits_for(upstream);
        // Declared before the guard so it drops after it, cancellation included.
        let _report = ActiveReport {
            filter: self,
            lb,
            server: &server,
        };
        let guard = lb.mark_start(&server);
        self.report_active(lb, &server);
        let started = Instant::now();

        let call = async {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| e.to_string())?;
            self.client.request(request).await.map_err(|e| e.to_string())
        };
        // Dropping `call` on timeout abandons the connection.
        let result = timeout(self.config.timeout(), call).await;
        let elapsed = started.elapsed();

        let (outcome, result) = match result {
            Ok(Ok(response)) => {
                guard.success(elapsed);
                let outcome = if response.status().is_success() {
                    DispatchOutcome::Success
                } else {
                    DispatchOutcome::UpstreamNon2xx
                };
                (outcome, Ok(Dispatched { server: server.clone(), response }))
            }
            Ok(Err(reason)) => {
                guard.failure(elapsed);
                warn!(%server, upstream, "Outbound call failed: {}", reason);
                (
                    DispatchOutcome::ConnectionFailure,
                    Err(GatewayError::OutboundConnectionFailure {
                        target: upstream.to_string(),
                        reason,
                    }),
                )
            }
            Err(_) => {
                guard.failure(elapsed);
                warn!(%server, upstream, "Outbound call timed out after {:?}", elapsed);
                (
                    DispatchOutcome::Timeout,
                    Err(GatewayError::OutboundTimeout {
                        target: upstream.to_string(),
                        timeout_ms: self.config.timeout_ms,
                    }),
                )
            }
        };

        debug!(%server, upstream, outcome = outcome.as_str(), ?elapsed, "Dispatch finished");
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream(upstream, &server.to_string(), outcome.as_str(), elapsed);
        }
        result
    }

    fn report_active(&self, lb: &LoadBalancer, server: &Server) {
        if let (Some(metrics), Some(stats)) = (&self.metrics, lb.server_stats(server)) {
            metrics.update_upstream_active(lb.name(), &server.to_string(), stats.active_requests);
        }
    }
}

/// Publishes the server's active count once the dispatch guard is gone.
struct ActiveReport<'a> {
    filter: &'a RouteFilter,
    lb: &'a LoadBalancer,
    server: &'a Server,
}

impl Drop for ActiveReport<'_> {
    fn drop(&mut self) {
        self.filter.report_active(self.lb, self.server);
    }
}

fn is_retryable(error: &GatewayError) -> RetryDecision {
    match error {
        GatewayError::OutboundTimeout { .. } | GatewayError::OutboundConnectionFailure { .. } => {
            RetryDecision::Retry
        }
        _ => RetryDecision::NoRetry,
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("gzip"))
}

#[async_trait]
impl Filter for RouteFilter {
    fn name(&self) -> &str {
        "route"
    }

    fn phase(&self) -> Phase {
        Phase::Route
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        ctx.route_target().is_some() && !ctx.response_sent()
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<()> {
        let Some(target) = ctx.route_target().cloned() else {
            return Ok(());
        };
        let Some(lb) = self.registry.get(&target.upstream) else {
            warn!(upstream = %target.upstream, "Route target is not registered");
            ctx.set_error(GatewayError::NoServerAvailable {
                target: target.upstream,
            });
            return Ok(());
        };
        if let Some(metrics) = &self.metrics {
            metrics.update_pool_size(lb.name(), lb.pool().list().len());
        }

        let outbound = self.outbound_request(ctx, target);
        let result = self
            .retry
            .execute_with_decision(|| self.attempt(&lb, &outbound), is_retryable)
            .await;

        match result {
            Ok(Dispatched { server, response }) => {
                let (parts, body) = response.into_parts();
                let headers = forwardable_headers(&parts.headers, &[]);
                ctx.set_response_gzipped(is_gzip(&headers));
                ctx.set_response_status(parts.status);
                *ctx.response_headers_mut() = headers;
                ctx.set_response_stream(body);
                ctx.set_chosen_server(server);
            }
            Err(error) => ctx.set_error(error),
        }
        Ok(())
    }
}
