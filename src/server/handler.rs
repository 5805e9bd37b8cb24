// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tower::Service;

use crate::gateway::Gateway;

/// tower `Service` adapter around the shared gateway.
#[derive(Clone)]
pub struct RequestHandler {
    gateway: Arc<Gateway>,
}

impl RequestHandler {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gateway = self.gateway.clone();
        // The gateway turns every failure into a response.
        Box::pin(async move { Ok(gateway.handle(req).await) })
    }
}
