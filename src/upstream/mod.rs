//
// src/upstream/mod.rs
//
mod pool;
mod refresh;
mod server;

pub use pool::{PoolSnapshot, RefreshHandle, ServerPool};
pub use refresh::{parse_server_list, FileSource, HttpSource, ServerListSource, StaticSource};
pub use server::{Server, ServerParseError};
