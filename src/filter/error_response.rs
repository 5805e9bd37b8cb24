// src/filter/error_response.rs
use super::chain::{Filter, Phase};
use super::context::RequestContext;
use anyhow::Result;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    request_id: String,
}

/// Renders the context's error as a JSON body with the mapped status.
#[derive(Debug, Default)]
pub struct ErrorResponseFilter;

impl ErrorResponseFilter {
    pub const ORDER: i32 = 0;

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Filter for ErrorResponseFilter {
    fn name(&self) -> &str {
        "error_response"
    }

    fn phase(&self) -> Phase {
        Phase::Error
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        ctx.has_error() && !ctx.error_handled()
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<()> {
        let Some(error) = ctx.error().cloned() else {
            return Ok(());
        };
        let body = serde_json::to_vec(&ErrorBody {
            error: error.kind(),
            message: error.public_reason(),
            request_id: ctx.id().to_string(),
        })?;

        ctx.set_response_status(error.status());
        let headers = ctx.response_headers_mut();
        headers.clear();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ctx.set_response_gzipped(false);
        ctx.set_response_body(body);
        ctx.mark_error_handled();
        Ok(())
    }
}
