// src/gateway/gateway.rs
use super::body::stream_body;
use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::filter::{FilterChain, InboundRequest, RequestContext, ResponseBody};
use crate::metrics::MetricsCollector;
use hyper::{Body, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tracing::{field, info, info_span, warn, Instrument};

/// Entry point for one inbound request: buffer it, run the chain, serialize
/// whatever the context ends up holding.
pub struct Gateway {
    chain: Arc<FilterChain>,
    stream_buffer_initial: usize,
    stream_buffer_max: usize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Gateway {
    pub fn new(chain: Arc<FilterChain>, server: &ServerConfig) -> Self {
        Self {
            chain,
            stream_buffer_initial: server.stream_buffer_initial,
            stream_buffer_max: server.stream_buffer_max,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn chain(&self) -> &Arc<FilterChain> {
        &self.chain
    }

    /// Never fails; every error becomes a response.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let span = info_span!(
            "request",
            id = field::Empty,
            method = %method,
            path = %req.uri().path()
        );

        async move {
            let (parts, body) = req.into_parts();
            let (request, read_error) = match hyper::body::to_bytes(body).await {
                Ok(bytes) => (InboundRequest::from_parts(parts, bytes), None),
                Err(e) => {
                    warn!("Failed to read request body: {}", e);
                    (
                        InboundRequest::from_parts(parts, Default::default()),
                        Some(GatewayError::BadRequest("unreadable request body".to_string())),
                    )
                }
            };

            let mut ctx = RequestContext::new(request);
            tracing::Span::current().record("id", field::display(ctx.id()));
            if let Some(error) = read_error {
                ctx.set_error(error);
            }

            let outcome = self.chain.run(&mut ctx).await;
            let response = self.render(ctx);

            let elapsed = started.elapsed();
            info!(
                status = response.status().as_u16(),
                ?outcome,
                ?elapsed,
                "Request completed"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_request(method.as_str(), response.status().as_u16(), elapsed);
            }
            response
        }
        .instrument(span)
        .await
    }

    fn render(&self, mut ctx: RequestContext) -> Response<Body> {
        if let Some(error) = ctx.error() {
            if !ctx.error_handled() {
                return Response::from(error);
            }
        }

        let status = match ctx.response_status() {
            Some(status) => status,
            None if ctx.has_response() || ctx.response_sent() => StatusCode::OK,
            None => {
                return Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("Not Found"))
                    .unwrap_or_default();
            }
        };

        let body = match ctx.take_response_body() {
            ResponseBody::Empty => Body::empty(),
            ResponseBody::Buffered(bytes) => Body::from(bytes),
            ResponseBody::Streaming(body) => {
                stream_body(body, self.stream_buffer_initial, self.stream_buffer_max)
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(ctx.response_headers_mut());
        response
    }
}
