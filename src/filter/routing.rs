// src/filter/routing.rs
use super::chain::{Filter, Phase};
use super::context::{RequestContext, RouteTarget};
use crate::config::RouteConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use tracing::debug;

struct Route {
    prefix: String,
    target: String,
    strip_prefix: bool,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }

    fn forward_path(&self, path: &str) -> String {
        if !self.strip_prefix || self.prefix == "/" {
            return path.to_string();
        }
        let rest = path.strip_prefix(self.prefix.trim_end_matches('/')).unwrap_or(path);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }
}

/// Picks the route target by longest matching path prefix.
pub struct RoutingFilter {
    routes: Vec<Route>,
}

impl RoutingFilter {
    pub const ORDER: i32 = 10;

    pub fn new(configs: &[RouteConfig]) -> Result<Self> {
        let mut routes = Vec::with_capacity(configs.len());
        for config in configs {
            let mut headers = Vec::new();
            for (name, value) in &config.add_request_headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("route '{}': invalid header name '{}'", config.prefix, name))?;
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("route '{}': invalid value for '{}'", config.prefix, name))?;
                headers.push((name, value));
            }
            routes.push(Route {
                prefix: config.prefix.clone(),
                target: config.target.clone(),
                strip_prefix: config.strip_prefix,
                headers,
            });
        }
        // longest prefix first
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes })
    }
}

#[async_trait]
impl Filter for RoutingFilter {
    fn name(&self) -> &str {
        "routing"
    }

    fn phase(&self) -> Phase {
        Phase::Pre
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        ctx.route_target().is_none()
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<()> {
        let path = ctx.request.path().to_string();
        let Some(route) = self.routes.iter().find(|route| route.matches(&path)) else {
            debug!(%path, "No route matched");
            return Ok(());
        };

        let mut forward = route.forward_path(&path);
        if let Some(query) = ctx.request.uri.query() {
            forward.push('?');
            forward.push_str(query);
        }
        debug!(%path, upstream = %route.target, %forward, "Routed request");

        for (name, value) in &route.headers {
            ctx.add_origin_request_header(name.clone(), value.clone());
        }
        ctx.set_route_target(RouteTarget::new(route.target.clone(), forward));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::context::InboundRequest;
    use hyper::{Method, Uri};
    use std::collections::HashMap;

    fn route(prefix: &str, target: &str, strip: bool) -> RouteConfig {
        RouteConfig {
            prefix: prefix.into(),
            target: target.into(),
            strip_prefix: strip,
            add_request_headers: HashMap::new(),
        }
    }

    async fn run(filter: &RoutingFilter, uri: &'static str) -> RequestContext {
        let mut ctx = RequestContext::new(InboundRequest::new(Method::GET, Uri::from_static(uri)));
        filter.execute(&mut ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_longest_prefix_wins_and_strips() {
        let filter = RoutingFilter::new(&[
            route("/api", "api", false),
            route("/api/users", "users", true),
        ])
        .unwrap();

        let ctx = run(&filter, "/api/users/42?full=true").await;
        assert_eq!(
            ctx.route_target(),
            Some(&RouteTarget::new("users", "/42?full=true"))
        );

        let ctx = run(&filter, "/api/orders").await;
        assert_eq!(ctx.route_target(), Some(&RouteTarget::new("api", "/api/orders")));
    }

    #[tokio::test]
    async fn test_prefix_respects_segment_boundary() {
        let filter = RoutingFilter::new(&[route("/zuul", "origin", true)]).unwrap();
        assert!(run(&filter, "/zuulish").await.route_target().is_none());
        assert_eq!(
            run(&filter, "/zuul").await.route_target(),
            Some(&RouteTarget::new("origin", "/"))
        );
    }

    #[tokio::test]
    async fn test_adds_origin_headers() {
        let mut config = route("/", "origin", false);
        config
            .add_request_headers
            .insert("cache-control".into(), "max-age=3600".into());
        let filter = RoutingFilter::new(&[config]).unwrap();

        let ctx = run(&filter, "/index.html").await;
        assert_eq!(
            ctx.origin_request_headers().get("cache-control").unwrap(),
            "max-age=3600"
        );
        assert_eq!(ctx.route_target().unwrap().path_and_query, "/index.html");
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let mut config = route("/", "origin", false);
        config.add_request_headers.insert("bad header".into(), "x".into());
        assert!(RoutingFilter::new(&[config]).is_err());
    }
}
