// src/filter/mod.rs
mod chain;
mod context;
mod error_response;
mod route;
mod routing;
mod send_response;

pub use chain::{ChainOutcome, Filter, FilterChain, Phase};
pub use context::{InboundRequest, RequestContext, ResponseBody, RouteTarget, Signal};
pub use error_response::ErrorResponseFilter;
pub use route::{forwardable_headers, DispatchOutcome, OutboundClient, RouteFilter};
pub use routing::RoutingFilter;
pub use send_response::{gunzip, SendResponseFilter};
