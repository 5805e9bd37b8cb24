// src/lib.rs
pub mod config;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod load_balancer;
pub mod metrics;
pub mod retry;
pub mod server;
pub mod upstream;
