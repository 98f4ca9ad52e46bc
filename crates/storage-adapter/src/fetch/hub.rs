//! Model hub fetcher
//!
//! A hub locator names one file of a repo revision or the whole repo
//! snapshot. Snapshots are listed first and then downloaded file by file into
//! a directory that mirrors the repo layout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use common::error::{Error, FetchError, Result};
use common::utils::format_bytes;
use config::HttpSettings;
use crate::fetch::http::{send, stream_to_file, within};
use crate::filesystem::is_safe_relative;
use crate::key::HubLocator;

/// Revision requested when the locator leaves it to the hub
pub const HUB_DEFAULT_REVISION: &str = "main";

/// Capability interface for model hubs
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Lists every file of a repo revision, as repo-relative paths
    async fn list_files(
        &self,
        repo: &str,
        revision: &str,
    ) -> std::result::Result<Vec<String>, FetchError>;

    /// Downloads one repo file into a new file at `dest`, returning the bytes written
    async fn download_file(
        &self,
        repo: &str,
        revision: &str,
        filename: &str,
        dest: &Path,
    ) -> std::result::Result<u64, FetchError>;
}

/// Fetcher for hub locators
#[derive(Clone)]
pub struct HubFetcher {
    client: Arc<dyn HubClient>,
}

impl HubFetcher {
    pub fn new(client: Arc<dyn HubClient>) -> Self {
        Self { client }
    }

    /// Fetches the locator into `dest`, returning the bytes written
    pub async fn fetch(&self, locator: &HubLocator, dest: &Path) -> Result<u64> {
        let revision = locator.revision.as_deref().unwrap_or(HUB_DEFAULT_REVISION);

        if let Some(filename) = &locator.filename {
            let bytes = self
                .client
                .download_file(&locator.repo, revision, filename, dest)
                .await?;
            return Ok(bytes);
        }

        let files = self.client.list_files(&locator.repo, revision).await?;
        if files.is_empty() {
            return Err(FetchError::not_found(format!(
                "hf://{}@{}: repo has no files",
                locator.repo, revision
            ))
            .into());
        }

        tokio::fs::create_dir_all(dest).await?;

        let mut total = 0u64;
        for file in &files {
            if !is_safe_relative(file) {
                return Err(Error::InvalidArgument(format!(
                    "hub listing for '{}' contains unsafe path '{}'",
                    locator.repo, file
                )));
            }
            let target = dest.join(file);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            total += self
                .client
                .download_file(&locator.repo, revision, file, &target)
                .await?;
        }

        info!(
            repo = %locator.repo,
            revision,
            files = files.len(),
            size = %format_bytes(total),
            "downloaded repo snapshot"
        );
        Ok(total)
    }
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RepoSibling>,
}

#[derive(Debug, Deserialize)]
struct RepoSibling {
    rfilename: String,
}

/// Hub client speaking the Hugging Face compatible HTTP API
#[derive(Clone)]
pub struct HttpHubClient {
    /// HTTP client
    client: Client,

    /// Hub base URL without a trailing slash
    endpoint: String,

    /// Bearer token, if any
    token: Option<String>,

    /// Longest wait for a response or the next body chunk
    read_timeout: Duration,
}

impl HttpHubClient {
    pub fn new(client: Client, endpoint: impl Into<String>, token: Option<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            client,
            endpoint,
            token: token.filter(|t| !t.is_empty()),
            read_timeout: HttpSettings::default().read_timeout(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl HubClient for HttpHubClient {
    async fn list_files(
        &self,
        repo: &str,
        revision: &str,
    ) -> std::result::Result<Vec<String>, FetchError> {
        let url = format!("{}/api/models/{}/revision/{}", self.endpoint, repo, revision);
        debug!(source = %url, "listing repo");

        let response = send(self.get(&url), &url, self.read_timeout).await?;
        let info: RepoInfo = within(self.read_timeout, response.json::<RepoInfo>(), || format!("{}: listing stalled", url))
            .await?
            .map_err(|e| FetchError::transient(format!("{}: invalid listing: {}", url, e)))?;

        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    async fn download_file(
        &self,
        repo: &str,
        revision: &str,
        filename: &str,
        dest: &Path,
    ) -> std::result::Result<u64, FetchError> {
        let url = format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, filename);
        debug!(source = %url, "requesting");

        let response = send(self.get(&url), &url, self.read_timeout).await?;
        stream_to_file(response, dest, &url, self.read_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::FetchErrorKind;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// In-memory hub
    #[derive(Default)]
    struct MemoryHub {
        files: HashMap<(String, String), Vec<(String, Vec<u8>)>>,
        requested_revisions: Mutex<Vec<String>>,
    }

    impl MemoryHub {
        fn with_repo(repo: &str, revision: &str, files: &[(&str, &[u8])]) -> Self {
            let mut hub = Self::default();
            hub.files.insert(
                (repo.to_string(), revision.to_string()),
                files
                    .iter()
                    .map(|(name, body)| (name.to_string(), body.to_vec()))
                    .collect(),
            );
            hub
        }
    }

    #[async_trait]
    impl HubClient for MemoryHub {
        async fn list_files(
            &self,
            repo: &str,
            revision: &str,
        ) -> std::result::Result<Vec<String>, FetchError> {
            self.requested_revisions.lock().unwrap().push(revision.to_string());
            self.files
                .get(&(repo.to_string(), revision.to_string()))
                .map(|files| files.iter().map(|(name, _)| name.clone()).collect())
                .ok_or_else(|| FetchError::not_found(repo.to_string()))
        }

        async fn download_file(
            &self,
            repo: &str,
            revision: &str,
            filename: &str,
            dest: &Path,
        ) -> std::result::Result<u64, FetchError> {
            self.requested_revisions.lock().unwrap().push(revision.to_string());
            let files = self
                .files
                .get(&(repo.to_string(), revision.to_string()))
                .ok_or_else(|| FetchError::not_found(repo.to_string()))?;
            let (_, body) = files
                .iter()
                .find(|(name, _)| name == filename)
                .ok_or_else(|| FetchError::not_found(filename.to_string()))?;
            tokio::fs::write(dest, body).await.unwrap();
            Ok(body.len() as u64)
        }
    }

    #[tokio::test]
    async fn test_single_file_uses_default_revision() {
        let hub = Arc::new(MemoryHub::with_repo("org/bert", "main", &[("config.json", b"{}")]));
        let fetcher = HubFetcher::new(hub.clone());
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("payload");

        let locator = HubLocator {
            repo: "org/bert".to_string(),
            revision: None,
            filename: Some("config.json".to_string()),
        };
        assert_eq!(fetcher.fetch(&locator, &dest).await.unwrap(), 2);
        assert_eq!(hub.requested_revisions.lock().unwrap().as_slice(), ["main"]);
    }

    #[tokio::test]
    async fn test_snapshot_mirrors_repo() {
        let hub = Arc::new(MemoryHub::with_repo(
            "org/bert",
            "v2",
            &[("config.json", b"{}"), ("onnx/model.onnx", b"abcdef")],
        ));
        let fetcher = HubFetcher::new(hub);
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("payload");

        let locator = HubLocator {
            repo: "org/bert".to_string(),
            revision: Some("v2".to_string()),
            filename: None,
        };
        assert_eq!(fetcher.fetch(&locator, &dest).await.unwrap(), 8);
        assert!(dest.join("config.json").is_file());
        assert!(dest.join("onnx/model.onnx").is_file());
    }

    #[tokio::test]
    async fn test_unknown_repo_is_not_found() {
        let fetcher = HubFetcher::new(Arc::new(MemoryHub::default()));
        let out = tempfile::tempdir().unwrap();
        let locator = HubLocator {
            repo: "org/missing".to_string(),
            revision: None,
            filename: None,
        };
        let err = fetcher.fetch(&locator, &out.path().join("p")).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NotFound));
    }

    /// Serves canned responses by request path; `/private/*` requires a bearer token
    async fn serve_routes(routes: HashMap<String, Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let authorized = request.to_ascii_lowercase().contains("authorization: bearer secret");

                let (status, body) = if path.starts_with("/private") && !authorized {
                    ("401 Unauthorized", Vec::new())
                } else {
                    match routes.get(&path) {
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", Vec::new()),
                    }
                };
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_hub_client_snapshot() {
        let mut routes = HashMap::new();
        routes.insert(
            "/api/models/org/bert/revision/main".to_string(),
            br#"{"siblings":[{"rfilename":"config.json"},{"rfilename":"model.bin"}]}"#.to_vec(),
        );
        routes.insert("/org/bert/resolve/main/config.json".to_string(), b"{}".to_vec());
        routes.insert("/org/bert/resolve/main/model.bin".to_string(), b"weights".to_vec());
        let endpoint = serve_routes(routes).await;

        let client = HttpHubClient::new(Client::new(), format!("{}/", endpoint), None);
        let fetcher = HubFetcher::new(Arc::new(client));
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("payload");

        let locator = HubLocator {
            repo: "org/bert".to_string(),
            revision: None,
            filename: None,
        };
        assert_eq!(fetcher.fetch(&locator, &dest).await.unwrap(), 9);
        assert_eq!(std::fs::read(dest.join("model.bin")).unwrap(), b"weights");
    }

    #[tokio::test]
    async fn test_http_hub_client_sends_token() {
        let mut routes = HashMap::new();
        routes.insert("/private/llm/resolve/main/w.bin".to_string(), b"secret-weights".to_vec());
        let endpoint = serve_routes(routes).await;
        let out = tempfile::tempdir().unwrap();

        let anonymous = HttpHubClient::new(Client::new(), endpoint.clone(), None);
        let err = anonymous
            .download_file("private/llm", "main", "w.bin", &out.path().join("a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Unauthorized);

        let authorized = HttpHubClient::new(Client::new(), endpoint, Some("secret".to_string()));
        let bytes = authorized
            .download_file("private/llm", "main", "w.bin", &out.path().join("b"))
            .await
            .unwrap();
        assert_eq!(bytes, 14);
    }

    #[tokio::test]
    async fn test_silent_hub_times_out_as_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });

        let client = HttpHubClient::new(Client::new(), format!("http://{}", addr), None)
            .with_read_timeout(Duration::from_millis(200));
        let err = client.list_files("org/bert", "main").await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::TransientNetwork);
    }
}
