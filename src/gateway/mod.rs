// src/gateway/mod.rs
mod body;
#[allow(clippy::module_inception)]
mod gateway;

pub use body::{stream_body, GrowableReader};
pub use gateway::Gateway;
