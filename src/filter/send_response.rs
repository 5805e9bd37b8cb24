// src/filter/send_response.rs
use super::chain::{Filter, Phase};
use super::context::{RequestContext, ResponseBody};
use crate::config::OutboundConfig;
use crate::error::GatewayError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use flate2::read::GzDecoder;
use futures::StreamExt;
use hyper::body::{Bytes, HttpBody};
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::Body;
use std::io::{self, Read};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Reconciles the origin's content coding with what the client accepts.
///
/// A gzipped origin body goes out untouched to clients that accept gzip.
/// Anyone else gets it decompressed; bytes that fail to decompress, or that
/// exceed the transcode limit, go out raw.
#[derive(Debug)]
pub struct SendResponseFilter {
    read_timeout: Duration,
    timeout_ms: u64,
    max_bytes: usize,
}

impl SendResponseFilter {
    pub const ORDER: i32 = 1000;

    pub fn new() -> Self {
        Self::from_outbound(&OutboundConfig::default())
    }

    /// Reading the origin body shares the outbound call deadline.
    pub fn from_outbound(config: &OutboundConfig) -> Self {
        Self {
            read_timeout: config.timeout(),
            timeout_ms: config.timeout_ms,
            max_bytes: config.max_transcode_bytes.max(1),
        }
    }
}

impl Default for SendResponseFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode `raw`, failing once the output would exceed `limit` bytes.
pub fn gunzip(raw: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(raw).take((limit as u64).saturating_add(1));
    let mut decoded = Vec::with_capacity(raw.len().saturating_mul(2).min(limit));
    decoder.read_to_end(&mut decoded)?;
    if decoded.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decoded body exceeds {} bytes", limit),
        ));
    }
    Ok(decoded)
}

enum Collected {
    Complete(Bytes),
    /// The limit was hit; the body, with what was already read put back in
    /// front.
    TooLarge(Body),
}

async fn collect_limited(mut body: Body, limit: usize) -> std::result::Result<Collected, hyper::Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        buf.extend_from_slice(&chunk?);
        if buf.len() > limit {
            let prefix = buf.freeze();
            let rest = futures::stream::once(async move { Ok::<_, hyper::Error>(prefix) }).chain(body);
            return Ok(Collected::TooLarge(Body::wrap_stream(rest)));
        }
    }
    Ok(Collected::Complete(buf.freeze()))
}

#[async_trait]
impl Filter for SendResponseFilter {
    fn name(&self) -> &str {
        "send_response"
    }

    fn phase(&self) -> Phase {
        Phase::Post
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        ctx.response_gzipped() && !ctx.has_error()
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<()> {
        if ctx.request.accepts_gzip() {
            ctx.response_headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            return Ok(());
        }

        let raw = match ctx.take_response_body() {
            ResponseBody::Empty => return Ok(()),
            ResponseBody::Buffered(bytes) => bytes,
            ResponseBody::Streaming(body) => {
                match timeout(self.read_timeout, collect_limited(body, self.max_bytes)).await {
                    Ok(Ok(Collected::Complete(bytes))) => bytes,
                    Ok(Ok(Collected::TooLarge(body))) => {
                        warn!(limit = self.max_bytes, "Gzipped origin body too large to transcode, passing it through");
                        ctx.set_response_stream(body);
                        return Ok(());
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        let target = ctx
                            .route_target()
                            .map(|t| t.upstream.clone())
                            .unwrap_or_default();
                        warn!(upstream = %target, "Origin body stalled after {:?}", self.read_timeout);
                        ctx.set_error(GatewayError::OutboundTimeout {
                            target,
                            timeout_ms: self.timeout_ms,
                        });
                        return Ok(());
                    }
                }
            }
        };

        match gunzip(&raw, self.max_bytes) {
            Ok(decoded) => {
                debug!(compressed = raw.len(), decoded = decoded.len(), "Decompressed origin body");
                let headers = ctx.response_headers_mut();
                headers.remove(CONTENT_ENCODING);
                headers.remove(CONTENT_LENGTH);
                ctx.set_response_gzipped(false);
                ctx.set_response_body(Bytes::from(decoded));
            }
            Err(e) => {
                warn!("Origin body could not be decompressed, passing it through: {}", e);
                ctx.set_response_body(raw);
            }
        }
        Ok(())
    }
}
