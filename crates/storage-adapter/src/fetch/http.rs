//! Plain HTTP(S) fetcher
//!
//! Downloads a single URL to a file, or a shard set into a directory with one
//! file per URL named after its basename. Any shard failing fails the set.
//!
//! There is no deadline on a whole transfer. Waiting for response headers
//! and for each body chunk is bounded by the read timeout instead, so a large
//! download on a slow link completes while a stalled one fails.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use common::error::{Error, FetchError, Result};
use common::utils::{format_bytes, url_basename};
use config::HttpSettings;
use crate::key::HttpLocator;

/// Fetcher for HTTP locators
#[derive(Clone)]
pub struct HttpFetcher {
    /// HTTP client
    client: Client,

    /// Shards downloaded concurrently within one shard set
    max_parallel_shards: usize,

    /// Longest wait for a response or the next body chunk
    read_timeout: Duration,
}

impl HttpFetcher {
    /// Creates a new HTTP fetcher from client settings
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = build_client(settings)?;
        Ok(Self::with_client(client, settings.max_parallel_shards).with_read_timeout(settings.read_timeout()))
    }

    /// Creates a fetcher around an existing client
    pub fn with_client(client: Client, max_parallel_shards: usize) -> Self {
        Self {
            client,
            max_parallel_shards: max_parallel_shards.max(1),
            read_timeout: HttpSettings::default().read_timeout(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Fetches the locator into `dest`, returning the bytes written
    pub async fn fetch(&self, locator: &HttpLocator, dest: &Path) -> Result<u64> {
        match locator {
            HttpLocator::Url(url) => Ok(self.fetch_url(url, dest).await?),
            HttpLocator::Shards(urls) => {
                tokio::fs::create_dir_all(dest).await?;

                let jobs: Vec<(String, PathBuf)> = urls
                    .iter()
                    .map(|url| (url.clone(), dest.join(url_basename(url))))
                    .collect();

                let total = futures::stream::iter(jobs)
                    .map(|(url, target)| {
                        let fetcher = self.clone();
                        async move { fetcher.fetch_url(&url, &target).await }
                    })
                    .buffer_unordered(self.max_parallel_shards)
                    .try_fold(0u64, |acc, bytes| async move { Ok::<_, FetchError>(acc + bytes) })
                    .await?;

                info!(shards = urls.len(), bytes = total, "downloaded shard set");
                Ok(total)
            }
        }
    }

    async fn fetch_url(&self, url: &str, dest: &Path) -> std::result::Result<u64, FetchError> {
        debug!(source = url, "requesting");
        let response = send(self.client.get(url), url, self.read_timeout).await?;
        stream_to_file(response, dest, url, self.read_timeout).await
    }
}

/// Builds the shared outbound client
///
/// Only connecting has a client-level timeout; reads are bounded per wait by
/// [`send`] and [`stream_to_file`].
pub fn build_client(settings: &HttpSettings) -> Result<Client> {
    Client::builder()
        .user_agent(settings.user_agent.clone())
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

/// Awaits one step of a transfer, failing as transient once `limit` passes
pub(crate) async fn within<T>(
    limit: Duration,
    step: impl Future<Output = T>,
    what: impl FnOnce() -> String,
) -> std::result::Result<T, FetchError> {
    tokio::time::timeout(limit, step).await.map_err(|_| {
        FetchError::transient(format!("{} (no progress for {}s)", what(), limit.as_secs_f32()))
    })
}

/// Sends a request and classifies non-success statuses
pub(crate) async fn send(
    request: RequestBuilder,
    context: &str,
    read_timeout: Duration,
) -> std::result::Result<Response, FetchError> {
    let response = within(read_timeout, request.send(), || format!("{}: no response", context))
        .await?
        .map_err(|e| classify_reqwest_error(&e, context))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::from_status(status.as_u16(), context));
    }
    Ok(response)
}

/// Streams a response body into a new file at `dest`
///
/// The body length is checked against `Content-Length` when the server
/// declares one.
pub(crate) async fn stream_to_file(
    response: Response,
    dest: &Path,
    context: &str,
    read_timeout: Duration,
) -> std::result::Result<u64, FetchError> {
    let declared = response.content_length();

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::partial_write(format!("{}: {}", context, e)))?;
    }
    let mut file = File::create(dest)
        .await
        .map_err(|e| FetchError::partial_write(format!("{}: {}", context, e)))?;

    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = within(read_timeout, stream.next(), || {
            format!("{}: body stalled after {} bytes", context, written)
        })
        .await?;
        let chunk = match next {
            Some(chunk) => chunk.map_err(|e| {
                FetchError::transient(format!("{}: body interrupted after {} bytes: {}", context, written, e))
            })?,
            None => break,
        };
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::partial_write(format!("{}: {}", context, e)))?;
        written += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| FetchError::partial_write(format!("{}: {}", context, e)))?;
    file.sync_all()
        .await
        .map_err(|e| FetchError::partial_write(format!("{}: {}", context, e)))?;

    if let Some(expected) = declared {
        if expected != written {
            return Err(FetchError::partial_write(format!(
                "{}: expected {} bytes, received {}",
                context, expected, written
            )));
        }
    }

    debug!(source = context, size = %format_bytes(written), "body written");
    Ok(written)
}

/// Maps a transport error to a fetch error
pub(crate) fn classify_reqwest_error(err: &reqwest::Error, context: &str) -> FetchError {
    if let Some(status) = err.status() {
        return FetchError::from_status(status.as_u16(), context);
    }
    FetchError::transient(format!("{}: {}", context, err))
}
