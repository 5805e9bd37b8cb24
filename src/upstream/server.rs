// src/upstream/server.rs
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use url::Url;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ServerParseError {
    #[error("expected host:port")]
    MissingPort,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("url has no host")]
    UrlWithoutHost,
    #[error("invalid host '{0}'")]
    InvalidHost(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// One concrete upstream endpoint. Immutable once built; cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Server {
    host: Arc<str>,
    port: u16,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host: String = host.into();
        Self {
            host: Arc::from(host),
            port,
        }
    }

    /// Parse `host:port`. IPv6 literals go in brackets: `[::1]:8080`.
    /// A bare origin URL such as `http://host:8080` is accepted too.
    pub fn parse(raw: &str) -> Result<Self, ServerParseError> {
        let raw = raw.trim();
        if raw.contains("://") {
            let url = Url::parse(raw).map_err(|e| ServerParseError::InvalidUrl(e.to_string()))?;
            if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
                return Err(ServerParseError::InvalidUrl(format!(
                    "'{}' names more than an origin",
                    raw
                )));
            }
            return Self::from_url(&url);
        }
        let (host, port) = raw.rsplit_once(':').ok_or(ServerParseError::MissingPort)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ServerParseError::EmptyHost);
        }
        if host.contains(|c: char| c == '/' || c == '@' || c.is_whitespace()) {
            return Err(ServerParseError::InvalidHost(host.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ServerParseError::InvalidPort(port.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn from_url(url: &Url) -> Result<Self, ServerParseError> {
        let host = url.host_str().ok_or(ServerParseError::UrlWithoutHost)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url
            .port_or_known_default()
            .ok_or(ServerParseError::MissingPort)?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Authority form used for the outbound `Host` header and URI.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server({})", self.authority())
    }
}

impl Serialize for Server {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.authority())
    }
}
