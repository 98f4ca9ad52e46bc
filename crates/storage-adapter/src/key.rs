//! Artifact keys and cache path derivation
//!
//! An [`ArtifactKey`] names one remote weight artifact and carries the
//! cache-relative path it materializes at. The path is a pure function of the
//! locator: every caller-supplied component is escaped into exactly one path
//! segment, so each source kind has a fixed depth below the cache root and no
//! entry can ever nest inside another.
//!
//! | kind | layout | depth |
//! |---|---|---|
//! | object store | `object_store/{bucket}/{key}` or `object_store/{bucket}/{prefix}/` | 2 |
//! | hub | `hub/{repo}/{revision\|default}/{filename\|*}` | 3 |
//! | http | `http/{hash}_{basename}` or `http/{hash}` for shard sets | 1 |

use std::fmt;
use std::path::{Path, PathBuf};

use common::error::{Error, Result};
use common::types::SourceKind;
use common::utils::{encode_path_segment, stable_hash_hex, url_basename};
use config::{HfWeight, HttpWeight, S3Weight, WeightSource};

/// Hex characters of the URL hash kept in HTTP cache paths
const URL_HASH_LEN: usize = 32;

/// Hub revision name that means "whatever the hub serves by default"
const DEFAULT_REVISION: &str = "default";

/// Segment used for whole-repo hub snapshots
const WHOLE_REPO: &str = "*";

/// Cache-relative path as an ordered list of segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CachePath(Vec<String>);

impl CachePath {
    pub(crate) fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Path segments, source kind first
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Source kind encoded in the first segment
    pub fn source_kind(&self) -> Option<SourceKind> {
        self.0.first().and_then(|s| s.parse().ok())
    }

    /// Relative filesystem path
    pub fn to_relative_path(&self) -> PathBuf {
        self.0.iter().collect()
    }

    /// Absolute path below `root`
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(self.to_relative_path())
    }
}

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Object store locator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectStoreLocator {
    /// A single object
    Object { bucket: String, key: String },
    /// Every object under a prefix; the prefix always ends in `/`
    Prefix { bucket: String, prefix: String },
}

impl ObjectStoreLocator {
    pub fn bucket(&self) -> &str {
        match self {
            ObjectStoreLocator::Object { bucket, .. } => bucket,
            ObjectStoreLocator::Prefix { bucket, .. } => bucket,
        }
    }
}

/// Model hub locator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HubLocator {
    /// Repository id, e.g. `org/model`
    pub repo: String,
    /// Revision; `None` means the hub default
    pub revision: Option<String>,
    /// Single file; `None` means the whole repo snapshot
    pub filename: Option<String>,
}

/// HTTP locator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HttpLocator {
    /// A single URL
    Url(String),
    /// A shard set; sorted and deduplicated
    Shards(Vec<String>),
}

/// Source-specific locator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    ObjectStore(ObjectStoreLocator),
    Hub(HubLocator),
    Http(HttpLocator),
}

impl Locator {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Locator::ObjectStore(_) => SourceKind::ObjectStore,
            Locator::Hub(_) => SourceKind::Hub,
            Locator::Http(_) => SourceKind::Http,
        }
    }

    /// Whether the artifact materializes as a directory
    pub fn is_directory(&self) -> bool {
        match self {
            Locator::ObjectStore(ObjectStoreLocator::Prefix { .. }) => true,
            Locator::ObjectStore(ObjectStoreLocator::Object { .. }) => false,
            Locator::Hub(hub) => hub.filename.is_none(),
            Locator::Http(HttpLocator::Shards(_)) => true,
            Locator::Http(HttpLocator::Url(_)) => false,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::ObjectStore(ObjectStoreLocator::Object { bucket, key }) => {
                write!(f, "s3://{}/{}", bucket, key)
            }
            Locator::ObjectStore(ObjectStoreLocator::Prefix { bucket, prefix }) => {
                write!(f, "s3://{}/{}", bucket, prefix)
            }
            Locator::Hub(hub) => {
                write!(f, "hf://{}", hub.repo)?;
                if let Some(revision) = &hub.revision {
                    write!(f, "@{}", revision)?;
                }
                if let Some(filename) = &hub.filename {
                    write!(f, "/{}", filename)?;
                }
                Ok(())
            }
            Locator::Http(HttpLocator::Url(url)) => write!(f, "{}", url),
            Locator::Http(HttpLocator::Shards(urls)) => {
                write!(f, "{} shards [{}, ...]", urls.len(), urls.first().map(String::as_str).unwrap_or(""))
            }
        }
    }
}

/// Derives the cache path for a locator
///
/// Deterministic across calls and process restarts: only the locator's own
/// bytes and fixed constants feed into it.
pub fn derive_cache_path(locator: &Locator) -> CachePath {
    let kind = locator.source_kind().as_str().to_string();

    let segments = match locator {
        Locator::ObjectStore(ObjectStoreLocator::Object { bucket, key }) => {
            vec![kind, encode_path_segment(bucket), encode_path_segment(key)]
        }
        Locator::ObjectStore(ObjectStoreLocator::Prefix { bucket, prefix }) => {
            vec![kind, encode_path_segment(bucket), encode_path_segment(prefix)]
        }
        Locator::Hub(hub) => vec![
            kind,
            encode_path_segment(&hub.repo),
            hub.revision
                .as_deref()
                .map(encode_path_segment)
                .unwrap_or_else(|| DEFAULT_REVISION.to_string()),
            hub.filename
                .as_deref()
                .map(encode_path_segment)
                .unwrap_or_else(|| WHOLE_REPO.to_string()),
        ],
        Locator::Http(HttpLocator::Url(url)) => {
            let hash = stable_hash_hex(&["url", url]);
            let hash = &hash[..URL_HASH_LEN];
            let basename = url_basename(url);
            let leaf = if basename.is_empty() {
                hash.to_string()
            } else {
                format!("{}_{}", hash, encode_path_segment(basename))
            };
            vec![kind, leaf]
        }
        Locator::Http(HttpLocator::Shards(urls)) => {
            let mut parts: Vec<&str> = Vec::with_capacity(urls.len() + 1);
            parts.push("shards");
            parts.extend(urls.iter().map(String::as_str));
            let hash = stable_hash_hex(&parts);
            vec![kind, hash[..URL_HASH_LEN].to_string()]
        }
    };

    CachePath::from_segments(segments)
}

/// Number of segments below the source-kind directory for entries of `kind`
pub fn entry_depth(kind: SourceKind) -> usize {
    match kind {
        SourceKind::ObjectStore => 2,
        SourceKind::Hub => 3,
        SourceKind::Http => 1,
    }
}

/// Identifier and canonical cache path of one remote weight artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    locator: Locator,
    cache_path: CachePath,
}

impl ArtifactKey {
    /// Builds a key from an already validated locator
    fn from_locator(locator: Locator) -> Self {
        let cache_path = derive_cache_path(&locator);
        Self {
            locator,
            cache_path,
        }
    }

    /// A single object-store object
    pub fn object(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let bucket = validate_bucket(bucket.into())?;
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidArgument("object key is empty".to_string()));
        }
        if key.ends_with('/') {
            return Err(Error::InvalidArgument(format!(
                "object key '{}' ends with '/'; use a prefix locator for directories",
                key
            )));
        }
        Ok(Self::from_locator(Locator::ObjectStore(ObjectStoreLocator::Object { bucket, key })))
    }

    /// Every object under an object-store prefix
    pub fn prefix(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let bucket = validate_bucket(bucket.into())?;
        let mut prefix = prefix.into();
        if prefix.trim_matches('/').is_empty() {
            return Err(Error::InvalidArgument("object prefix is empty".to_string()));
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Ok(Self::from_locator(Locator::ObjectStore(ObjectStoreLocator::Prefix { bucket, prefix })))
    }

    /// A hub repo file, or the whole repo snapshot when `filename` is `None`
    pub fn hub(
        repo: impl Into<String>,
        revision: Option<String>,
        filename: Option<String>,
    ) -> Result<Self> {
        let repo = repo.into();
        if repo.trim_matches('/').is_empty() {
            return Err(Error::InvalidArgument("hub repo is empty".to_string()));
        }

        // "default" and "no revision" are the same locator
        let revision = revision.filter(|r| !r.is_empty() && r != DEFAULT_REVISION);

        if let Some(filename) = &filename {
            if filename.is_empty() || filename == WHOLE_REPO {
                return Err(Error::InvalidArgument(format!(
                    "invalid hub filename '{}'",
                    filename
                )));
            }
        }

        Ok(Self::from_locator(Locator::Hub(HubLocator {
            repo,
            revision,
            filename,
        })))
    }

    /// A single HTTP(S) URL
    pub fn url(url: impl Into<String>) -> Result<Self> {
        let url = validate_url(url.into())?;
        Ok(Self::from_locator(Locator::Http(HttpLocator::Url(url))))
    }

    /// A shard set of HTTP(S) URLs that materialize as one directory
    ///
    /// Order and duplicates do not matter. Two distinct URLs with the same
    /// basename are rejected since each shard is stored under its basename.
    pub fn shards<I, S>(urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut urls = urls
            .into_iter()
            .map(|u| validate_url(u.into()))
            .collect::<Result<Vec<_>>>()?;
        urls.sort();
        urls.dedup();

        if urls.is_empty() {
            return Err(Error::InvalidArgument("shard set has no URLs".to_string()));
        }

        let mut basenames = std::collections::HashSet::new();
        for url in &urls {
            let basename = url_basename(url);
            if basename.is_empty() || basename == "." || basename == ".." {
                return Err(Error::InvalidArgument(format!("shard URL '{}' has no file name", url)));
            }
            if !basenames.insert(basename) {
                return Err(Error::InvalidArgument(format!(
                    "shard set has more than one file named '{}'",
                    basename
                )));
            }
        }

        Ok(Self::from_locator(Locator::Http(HttpLocator::Shards(urls))))
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn cache_path(&self) -> &CachePath {
        &self.cache_path
    }

    pub fn source_kind(&self) -> SourceKind {
        self.locator.source_kind()
    }

    pub fn is_directory(&self) -> bool {
        self.locator.is_directory()
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.locator)
    }
}

impl TryFrom<&WeightSource> for ArtifactKey {
    type Error = Error;

    fn try_from(source: &WeightSource) -> Result<Self> {
        match source {
            WeightSource::S3(S3Weight { bucket, key, prefix, .. }) => match (key, prefix) {
                (Some(key), None) => ArtifactKey::object(bucket.clone(), key.clone()),
                (None, Some(prefix)) => ArtifactKey::prefix(bucket.clone(), prefix.clone()),
                _ => Err(Error::InvalidArgument(format!(
                    "s3 weight in bucket '{}' needs exactly one of 'key' or 'prefix'",
                    bucket
                ))),
            },
            WeightSource::Hf(HfWeight { repo, filename, revision }) => {
                ArtifactKey::hub(repo.clone(), revision.clone(), filename.clone())
            }
            WeightSource::Http(HttpWeight { url, urls }) => match (url, urls) {
                (Some(url), None) => ArtifactKey::url(url.clone()),
                (None, Some(urls)) => ArtifactKey::shards(urls.iter().cloned()),
                _ => Err(Error::InvalidArgument(
                    "http weight needs exactly one of 'url' or 'urls'".to_string(),
                )),
            },
        }
    }
}

fn validate_bucket(bucket: String) -> Result<String> {
    if bucket.is_empty() || bucket.contains('/') {
        return Err(Error::InvalidArgument(format!("invalid bucket name '{}'", bucket)));
    }
    Ok(bucket)
}

fn validate_url(url: String) -> Result<String> {
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(Error::InvalidArgument(format!("not an http(s) URL: '{}'", url)));
    }
    Ok(url)
}
