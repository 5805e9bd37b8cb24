// src/upstream/refresh.rs
use super::server::Server;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Where a pool's server list comes from.
#[async_trait]
pub trait ServerListSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Server>>;

    fn describe(&self) -> String;
}

pub struct StaticSource {
    servers: Vec<Server>,
}

impl StaticSource {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ServerListSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<Server>> {
        Ok(self.servers.clone())
    }

    fn describe(&self) -> String {
        format!("static({} servers)", self.servers.len())
    }
}

/// Re-reads a plain-text list such as `www.aaa.com:80,www.baidu.com:80`.
/// Entries may be split by commas, whitespace or newlines; lines starting
/// with `#` are ignored.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn parse_server_list(contents: &str) -> Result<Vec<Server>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .flat_map(|line| line.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|entry| !entry.is_empty())
        .map(|entry| Server::parse(entry).with_context(|| format!("invalid server '{}'", entry)))
        .collect()
}

#[async_trait]
impl ServerListSource for FileSource {
    async fn fetch(&self) -> Result<Vec<Server>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read server list {}", self.path.display()))?;
        parse_server_list(&contents)
    }

    fn describe(&self) -> String {
        format!("file({})", self.path.display())
    }
}

/// GETs a JSON array of `"host:port"` strings.
pub struct HttpSource {
    url: Url,
    client: Client,
}

impl HttpSource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ServerListSource for HttpSource {
    async fn fetch(&self) -> Result<Vec<Server>> {
        let response = self
            .client
            .get(self.url.as_str())
            .send()
            .await
            .context("Server list request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Server list endpoint answered HTTP {}", status);
        }

        let entries: Vec<String> = response
            .json()
            .await
            .context("Server list is not a JSON array of strings")?;

        entries
            .iter()
            .map(|entry| Server::parse(entry).with_context(|| format!("invalid server '{}'", entry)))
            .collect()
    }

    fn describe(&self) -> String {
        format!("http({})", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_list_mixed_separators() {
        let list = "# primary\nwww.aaa.com:80, www.baidu.com:80\n\n10.0.0.1:8080 10.0.0.2:8080\n";
        let servers = parse_server_list(list).unwrap();
        assert_eq!(
            servers,
            vec![
                Server::new("www.aaa.com", 80),
                Server::new("www.baidu.com", 80),
                Server::new("10.0.0.1", 8080),
                Server::new("10.0.0.2", 8080),
            ]
        );
    }

    #[test]
    fn test_parse_server_list_rejects_bad_entry() {
        assert!(parse_server_list("a:80,b").is_err());
    }

    #[tokio::test]
    async fn test_file_source_reads_file() {
        let path = std::env::temp_dir().join(format!("servers-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "one:1,two:2").await.unwrap();

        let source = FileSource::new(&path);
        let servers = source.fetch().await.unwrap();
        assert_eq!(servers, vec![Server::new("one", 1), Server::new("two", 2)]);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(source.fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_http_source() {
        let mut upstream = mockito::Server::new_async().await;
        let mock = upstream
            .mock("GET", "/servers")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"["10.1.0.1:80","10.1.0.2:81"]"#)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/servers", upstream.url())).unwrap();
        let source = HttpSource::new(url, Duration::from_secs(2)).unwrap();
        let servers = source.fetch().await.unwrap();

        mock.assert_async().await;
        assert_eq!(servers, vec![Server::new("10.1.0.1", 80), Server::new("10.1.0.2", 81)]);
    }

    #[tokio::test]
    async fn test_http_source_error_status() {
        let mut upstream = mockito::Server::new_async().await;
        let _mock = upstream
            .mock("GET", "/servers")
            .with_status(500)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/servers", upstream.url())).unwrap();
        let source = HttpSource::new(url, Duration::from_secs(2)).unwrap();
        assert!(source.fetch().await.is_err());
    }
}
