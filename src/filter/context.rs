// src/filter/context.rs
use crate::error::GatewayError;
use crate::upstream::Server;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, ACCEPT_ENCODING};
use hyper::http::request::Parts;
use hyper::{Body, HeaderMap, Method, StatusCode, Uri};
use std::collections::HashMap;
use uuid::Uuid;

/// The inbound request with its body already buffered.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn from_parts(parts: Parts, body: Bytes) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn accepts_gzip(&self) -> bool {
        self.headers
            .get_all(ACCEPT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|coding| {
                let mut parts = coding.trim().split(';');
                let name = parts.next().unwrap_or("").trim();
                let refused = parts.any(|p| matches!(p.trim(), "q=0" | "q=0.0" | "q=0.00" | "q=0.000"));
                name.eq_ignore_ascii_case("gzip") && !refused
            })
    }
}

/// Where the route phase should send the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Name of the load-balanced target.
    pub upstream: String,
    /// Path and query to send upstream.
    pub path_and_query: String,
}

impl RouteTarget {
    pub fn new(upstream: impl Into<String>, path_and_query: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            path_and_query: path_and_query.into(),
        }
    }
}

pub enum ResponseBody {
    Empty,
    Buffered(Bytes),
    Streaming(Body),
}

impl ResponseBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Ad hoc value one filter leaves for another.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Flag(bool),
    Text(String),
    Number(i64),
}

/// Per-request state shared by every filter of one chain run.
#[derive(Debug)]
pub struct RequestContext {
    id: Uuid,
    pub request: InboundRequest,
    route_target: Option<RouteTarget>,
    origin_request_headers: HeaderMap,
    chosen_server: Option<Server>,
    response_status: Option<StatusCode>,
    response_headers: HeaderMap,
    response_body: ResponseBody,
    response_sent: bool,
    response_gzipped: bool,
    error: Option<GatewayError>,
    error_handled: bool,
    signals: HashMap<String, Signal>,
}

impl RequestContext {
    pub fn new(request: InboundRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            route_target: None,
            origin_request_headers: HeaderMap::new(),
            chosen_server: None,
            response_status: None,
            response_headers: HeaderMap::new(),
            response_body: ResponseBody::Empty,
            response_sent: false,
            response_gzipped: false,
            error: None,
            error_handled: false,
            signals: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    // routing

    pub fn set_route_target(&mut self, target: RouteTarget) {
        self.route_target = Some(target);
    }

    pub fn route_target(&self) -> Option<&RouteTarget> {
        self.route_target.as_ref()
    }

    /// Header sent to the origin in addition to the forwarded ones.
    pub fn add_origin_request_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.origin_request_headers.insert(name, value);
    }

    pub fn origin_request_headers(&self) -> &HeaderMap {
        &self.origin_request_headers
    }

    pub fn set_chosen_server(&mut self, server: Server) {
        self.chosen_server = Some(server);
    }

    pub fn chosen_server(&self) -> Option<&Server> {
        self.chosen_server.as_ref()
    }

    // response

    pub fn set_response_status(&mut self, status: StatusCode) {
        self.response_status = Some(status);
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    pub fn set_response_body(&mut self, body: impl Into<Bytes>) {
        self.response_body = ResponseBody::Buffered(body.into());
    }

    pub fn set_response_stream(&mut self, body: Body) {
        self.response_body = ResponseBody::Streaming(body);
    }

    pub fn response_body(&self) -> &ResponseBody {
        &self.response_body
    }

    pub fn take_response_body(&mut self) -> ResponseBody {
        std::mem::replace(&mut self.response_body, ResponseBody::Empty)
    }

    pub fn has_response(&self) -> bool {
        self.response_status.is_some() || !self.response_body.is_empty()
    }

    /// Respond with what the context holds now and skip every remaining
    /// non-error filter.
    pub fn set_response_sent(&mut self) {
        self.response_sent = true;
    }

    pub fn response_sent(&self) -> bool {
        self.response_sent
    }

    pub fn set_response_gzipped(&mut self, gzipped: bool) {
        self.response_gzipped = gzipped;
    }

    pub fn response_gzipped(&self) -> bool {
        self.response_gzipped
    }

    // errors

    pub fn set_error(&mut self, error: GatewayError) {
        self.error = Some(error);
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// An error filter produced the response for the current error.
    pub fn mark_error_handled(&mut self) {
        self.error_handled = true;
    }

    pub fn error_handled(&self) -> bool {
        self.error_handled
    }

    // signals

    pub fn set_signal(&mut self, key: impl Into<String>, value: Signal) {
        self.signals.insert(key.into(), value);
    }

    pub fn signal(&self, key: &str) -> Option<&Signal> {
        self.signals.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.signals.get(key), Some(Signal::Flag(true)))
    }

    pub fn remove_signal(&mut self, key: &str) -> Option<Signal> {
        self.signals.remove(key)
    }
}
