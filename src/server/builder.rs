// src/server/builder.rs
use crate::server::listener::bind_tcp;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use hyper::{server::conn::Http, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::Service;

/// Builder so `main.rs` can inject the gateway handler and a shutdown
/// trigger.
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
    shutdown: Option<BoxFuture<'static, ()>>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
            shutdown: None,
        }
    }

    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Stop accepting once `signal` resolves; open connections finish their
    /// in-flight request and close.
    pub fn with_shutdown<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let listener = bind_tcp(self.addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        let handler = self
            .handler
            .ok_or_else(|| anyhow!("handler must be set via with_handler()"))?;
        let mut shutdown = self
            .shutdown
            .unwrap_or_else(|| Box::pin(futures::future::pending()));
        let (closing_tx, closing_rx) = watch::channel(false);

        tracing::info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };
            let svc = handler.clone();
            let mut closing = closing_rx.clone();

            // One task per connection.
            tokio::spawn(async move {
                let conn = Http::new().http1_only(true).serve_connection(stream, svc);
                tokio::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = closing.changed() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(err) = result {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }

        tracing::info!("Shutting down, draining open connections");
        let _ = closing_tx.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let handler = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("pong")))
        });
        let server = tokio::spawn(
            ServerBuilder::new(addr)
                .with_handler(handler)
                .with_shutdown(async {
                    let _ = stop_rx.await;
                })
                .serve_on(listener),
        );

        let response = hyper::Client::new()
            .get(format!("http://{}/", addr).parse().unwrap())
            .await
            .unwrap();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"pong");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
