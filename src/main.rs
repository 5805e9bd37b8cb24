// src/main.rs
use anyhow::Result;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use rust_filter_gateway::{
    config::{self, MetricsConfig},
    filter::{ErrorResponseFilter, FilterChain, RouteFilter, RoutingFilter, SendResponseFilter},
    gateway::Gateway,
    load_balancer::LoadBalancerRegistry,
    metrics::MetricsRegistry,
    server::{RequestHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rust_filter_gateway=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    // One load balancer per target, refresh tasks included
    let registry = Arc::new(LoadBalancerRegistry::from_config(&config)?);

    let mut chain = FilterChain::new().with_metrics(metrics.clone());
    chain.register(Arc::new(RoutingFilter::new(&config.routes)?));
    chain.register(Arc::new(RouteFilter::new(
        registry.clone(),
        config.outbound.clone(),
        Some(metrics.clone()),
    )?));
    chain.register(Arc::new(SendResponseFilter::from_outbound(&config.outbound)));
    chain.register(Arc::new(ErrorResponseFilter::new()));
    info!(filters = chain.len(), "Filter chain ready");

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, registry.clone(), config.metrics.clone())
            .await?;
    }

    let gateway = Gateway::new(Arc::new(chain), &config.server).with_metrics(metrics);
    let handler = RequestHandler::new(Arc::new(gateway));

    info!("Starting gateway on {}", config.server.listen);
    ServerBuilder::new(config.server.listen)
        .with_handler(handler)
        .with_shutdown(shutdown_signal())
        .serve()
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    metrics: MetricsRegistry,
    balancers: Arc<LoadBalancerRegistry>,
    config: MetricsConfig,
) -> Result<()> {
    let metrics = Arc::new(metrics);
    let config = Arc::new(config);
    let service_config = config.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let metrics = metrics.clone();
        let balancers = balancers.clone();
        let config = service_config.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let response = side_response(req.uri().path(), &metrics, &balancers, &config);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);

    info!(
        "Metrics server listening on http://{}{} (stats at {})",
        addr, config.path, config.stats_path
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn side_response(
    path: &str,
    metrics: &MetricsRegistry,
    balancers: &LoadBalancerRegistry,
    config: &MetricsConfig,
) -> Response<Body> {
    let rendered = if path == config.path {
        metrics
            .gather()
            .map(|body| (StatusCode::OK, "text/plain; version=0.0.4", body))
    } else if path == config.stats_path {
        serde_json::to_vec_pretty(&balancers.snapshot())
            .map(|body| (StatusCode::OK, "application/json", body))
            .map_err(anyhow::Error::from)
    } else {
        Ok((StatusCode::NOT_FOUND, "text/plain", b"Not Found".to_vec()))
    };

    let (status, content_type, body) = rendered.unwrap_or_else(|e| {
        error!("Failed to render {}: {}", path, e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            b"Internal Server Error".to_vec(),
        )
    });

    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Body::from(body))
        .unwrap_or_default()
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
