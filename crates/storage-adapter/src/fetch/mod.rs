//! Source fetchers
//!
//! One fetcher per source kind. A fetcher makes a single attempt to write
//! an artifact to a destination path and reports bytes written; it never
//! retries and never touches the cache index.

pub mod http;
pub mod hub;
pub mod object_store;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use common::error::{Error, Result};
use common::types::SourceKind;
use config::ServeConfig;
use crate::key::{ArtifactKey, Locator};

pub use self::http::{build_client, HttpFetcher};
pub use self::hub::{HttpHubClient, HubClient, HubFetcher, HUB_DEFAULT_REVISION};
pub use self::object_store::{
    FsObjectStore, ObjectDownload, ObjectStoreClient, ObjectStoreFetcher, ObjectSummary,
};

/// Fetcher for one source kind
#[derive(Clone)]
pub enum SourceFetcher {
    ObjectStore(ObjectStoreFetcher),
    Hub(HubFetcher),
    Http(HttpFetcher),
}

impl SourceFetcher {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceFetcher::ObjectStore(_) => SourceKind::ObjectStore,
            SourceFetcher::Hub(_) => SourceKind::Hub,
            SourceFetcher::Http(_) => SourceKind::Http,
        }
    }

    /// Writes the artifact named by `locator` to `dest`
    ///
    /// `dest` does not exist beforehand; it becomes a file or a directory
    /// depending on the locator.
    pub async fn fetch(&self, locator: &Locator, dest: &Path) -> Result<u64> {
        match (self, locator) {
            (SourceFetcher::ObjectStore(fetcher), Locator::ObjectStore(locator)) => {
                fetcher.fetch(locator, dest).await
            }
            (SourceFetcher::Hub(fetcher), Locator::Hub(locator)) => fetcher.fetch(locator, dest).await,
            (SourceFetcher::Http(fetcher), Locator::Http(locator)) => fetcher.fetch(locator, dest).await,
            _ => Err(Error::Internal(format!(
                "{} fetcher cannot handle {} locator",
                self.kind(),
                locator.source_kind()
            ))),
        }
    }
}

/// The fetchers available to a cache, keyed by source kind
#[derive(Clone, Default)]
pub struct FetcherSet {
    fetchers: BTreeMap<SourceKind, SourceFetcher>,
}

impl FetcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fetcher, replacing any previous one of the same kind
    pub fn register(&mut self, fetcher: SourceFetcher) {
        self.fetchers.insert(fetcher.kind(), fetcher);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, fetcher: SourceFetcher) -> Self {
        self.register(fetcher);
        self
    }

    /// Builds the fetchers described by the configuration
    ///
    /// HTTP and hub fetchers are always available. The object store fetcher
    /// is only registered when a mount directory is configured.
    pub fn from_config(config: &ServeConfig) -> Result<Self> {
        let client = build_client(&config.http)?;

        let mut set = Self::new()
            .with(SourceFetcher::Http(
                HttpFetcher::with_client(client.clone(), config.http.max_parallel_shards)
                    .with_read_timeout(config.http.read_timeout()),
            ))
            .with(SourceFetcher::Hub(HubFetcher::new(Arc::new(
                HttpHubClient::new(
                    client,
                    config.hub.endpoint.clone(),
                    config.credentials.hub_token.clone(),
                )
                .with_read_timeout(config.http.read_timeout()),
            ))));

        match &config.object_store.mount_dir {
            Some(mount_dir) => {
                debug!(mount_dir = %mount_dir.display(), "object store backed by mounted directory");
                set.register(SourceFetcher::ObjectStore(ObjectStoreFetcher::new(Arc::new(
                    FsObjectStore::new(mount_dir.clone()),
                ))));
            }
            None => warn!("no object store backend configured; s3 weights cannot be fetched"),
        }

        Ok(set)
    }

    pub fn get(&self, kind: SourceKind) -> Option<&SourceFetcher> {
        self.fetchers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.fetchers.keys().copied().collect()
    }

    /// Fetches `key` into `dest` with the fetcher for its source kind
    pub async fn fetch(&self, key: &ArtifactKey, dest: &Path) -> Result<u64> {
        let fetcher = self.get(key.source_kind()).ok_or_else(|| {
            Error::Config(format!("no fetcher configured for {} sources", key.source_kind()))
        })?;
        fetcher.fetch(key.locator(), dest).await
    }
}
