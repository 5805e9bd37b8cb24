// src/config/models.rs
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::upstream::Server;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate target name '{0}'")]
    DuplicateTarget(String),

    #[error("target '{target}' has invalid server '{server}': {reason}")]
    InvalidServer {
        target: String,
        server: String,
        reason: String,
    },

    #[error("route '{prefix}' references unknown target '{target}'")]
    UnknownRouteTarget { prefix: String, target: String },

    #[error("route prefix '{0}' must start with '/'")]
    InvalidRoutePrefix(String),

    #[error("target '{0}': refresh source is missing its {1}")]
    IncompleteRefresh(String, &'static str),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// First read size for streamed response bodies.
    #[serde(default = "default_stream_buffer_initial")]
    pub stream_buffer_initial: usize,
    #[serde(default = "default_stream_buffer_max")]
    pub stream_buffer_max: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            stream_buffer_initial: default_stream_buffer_initial(),
            stream_buffer_max: default_stream_buffer_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after the first one. Zero unless configured.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(default = "default_connect_pool_size")]
    pub connect_pool_size: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Request headers never forwarded, on top of the hop-by-hop set.
    #[serde(default)]
    pub strip_headers: Vec<String>,
    /// Largest body, compressed or decoded, buffered for gzip transcoding.
    /// Anything larger passes through still compressed.
    #[serde(default = "default_max_transcode_bytes")]
    pub max_transcode_bytes: usize,
}

impl OutboundConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: 0,
            follow_redirects: false,
            connect_pool_size: default_connect_pool_size(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            strip_headers: Vec::new(),
            max_transcode_bytes: default_max_transcode_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<String>,
    /// Dispatch over https instead of http.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub rule: RuleKind,
    #[serde(default)]
    pub availability: AvailabilityConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl TargetConfig {
    pub fn parsed_servers(&self) -> Result<Vec<Server>, ConfigError> {
        self.servers
            .iter()
            .map(|raw| {
                Server::parse(raw).map_err(|e| ConfigError::InvalidServer {
                    target: self.name.clone(),
                    server: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    RoundRobin,
    LeastActive,
    ResponseTime,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Consecutive failures that take a server out of rotation.
    #[serde(default = "default_failure_threshold")]
    pub threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl AvailabilityConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    #[default]
    Static,
    File,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default)]
    pub kind: RefreshKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            kind: RefreshKind::Static,
            path: None,
            url: None,
            interval_secs: default_refresh_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub target: String,
    #[serde(default)]
    pub strip_prefix: bool,
    /// Headers added to the origin request, e.g. `cache-control`.
    #[serde(default)]
    pub add_request_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_stats_path")]
    pub stats_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
            stats_path: default_stats_path(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound.timeout_ms",
                "must be greater than zero".into(),
            ));
        }
        if self.outbound.follow_redirects {
            return Err(ConfigError::InvalidValue(
                "outbound.follow_redirects",
                "redirects are passed through to the client, set it to false".into(),
            ));
        }
        if self.outbound.connect_pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound.connect_pool_size",
                "must be greater than zero".into(),
            ));
        }
        if self.server.stream_buffer_initial == 0
            || self.server.stream_buffer_initial > self.server.stream_buffer_max
        {
            return Err(ConfigError::InvalidValue(
                "server.stream_buffer_initial",
                format!(
                    "must be in 1..={} (stream_buffer_max)",
                    self.server.stream_buffer_max
                ),
            ));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }
            target.parsed_servers()?;

            if target.availability.enabled && target.availability.threshold == 0 {
                return Err(ConfigError::InvalidValue(
                    "availability.threshold",
                    format!("target '{}' needs a threshold of at least 1", target.name),
                ));
            }

            match target.refresh.kind {
                RefreshKind::Static => {}
                RefreshKind::File if target.refresh.path.is_none() => {
                    return Err(ConfigError::IncompleteRefresh(target.name.clone(), "path"));
                }
                RefreshKind::Http if target.refresh.url.is_none() => {
                    return Err(ConfigError::IncompleteRefresh(target.name.clone(), "url"));
                }
                _ if target.refresh.interval_secs == 0 => {
                    return Err(ConfigError::InvalidValue(
                        "refresh.interval_secs",
                        format!("target '{}' needs a non-zero interval", target.name),
                    ));
                }
                _ => {}
            }
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(ConfigError::InvalidRoutePrefix(route.prefix.clone()));
            }
            if !names.contains(route.target.as_str()) {
                return Err(ConfigError::UnknownRouteTarget {
                    prefix: route.prefix.clone(),
                    target: route.target.clone(),
                });
            }
        }

        Ok(())
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_stream_buffer_initial() -> usize {
    1024
}

fn default_stream_buffer_max() -> usize {
    64 * 1024
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_connect_pool_size() -> usize {
    50
}

fn default_max_transcode_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_max_ms() -> u64 {
    1_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_stats_path() -> String {
    "/stats".to_string()
}
