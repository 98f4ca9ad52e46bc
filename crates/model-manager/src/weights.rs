//! Model weight sets
//!
//! A weight set maps the slot names a model expects (`model`, `tokenizer`,
//! ...) to artifact keys. Materializing a set resolves every slot through
//! the content cache concurrently.

use std::collections::BTreeMap;
use std::path::PathBuf;
use futures::future::try_join_all;
use tracing::debug;

use common::error::{Error, Result};
use config::ModelDeployConfig;
use storage_adapter::{ArtifactKey, ContentCache};

/// Slot name to artifact key mapping for one model load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelWeightSet {
    slots: BTreeMap<String, ArtifactKey>,
}

impl ModelWeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a slot
    pub fn insert(&mut self, slot: impl Into<String>, key: ArtifactKey) -> Option<ArtifactKey> {
        self.slots.insert(slot.into(), key)
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with(mut self, slot: impl Into<String>, key: ArtifactKey) -> Self {
        self.insert(slot, key);
        self
    }

    /// Builds the set from a deploy entry
    pub fn from_deploy(deploy: &ModelDeployConfig) -> Result<Self> {
        let mut set = Self::new();
        for (slot, source) in &deploy.weights {
            let key = ArtifactKey::try_from(source).map_err(|e| {
                Error::InvalidArgument(format!("weight slot '{}': {}", slot, e))
            })?;
            set.insert(slot.clone(), key);
        }
        Ok(set)
    }

    /// Fails when any of `slots` is missing from the set
    pub fn require(&self, slots: &[&str]) -> Result<()> {
        let missing: Vec<&str> = slots
            .iter()
            .copied()
            .filter(|slot| !self.slots.contains_key(*slot))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "missing required weights: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn get(&self, slot: &str) -> Option<&ArtifactKey> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArtifactKey)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Materializes every slot of `weights`, returning slot to local path
///
/// Slots are resolved concurrently; the first failure fails the whole set.
/// Slots sharing a key share one fetch.
pub async fn materialize_weight_set(
    cache: &ContentCache,
    weights: &ModelWeightSet,
) -> Result<BTreeMap<String, PathBuf>> {
    let resolved = try_join_all(weights.iter().map(|(slot, key)| {
        let (cache, slot, key) = (cache.clone(), slot.clone(), key.clone());
        async move {
            let path = cache.materialize(&key).await?;
            debug!(slot = %slot, path = %path.display(), "weight slot ready");
            Ok::<_, Error>((slot, path))
        }
    }))
    .await?;

    Ok(resolved.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{HttpWeight, S3Weight, WeightSource};
    use std::sync::Arc;
    use storage_adapter::{FetcherSet, FsObjectStore, ObjectStoreFetcher, SourceFetcher};

    fn deploy() -> ModelDeployConfig {
        let mut deploy = ModelDeployConfig::default();
        deploy.weights.insert(
            "model".to_string(),
            WeightSource::S3(S3Weight {
                bucket: "weights".to_string(),
                key: Some("clf/model.pt".to_string()),
                prefix: None,
                region: None,
            }),
        );
        deploy.weights.insert(
            "vocab".to_string(),
            WeightSource::S3(S3Weight {
                bucket: "weights".to_string(),
                key: Some("clf/vocab.txt".to_string()),
                prefix: None,
                region: None,
            }),
        );
        deploy
    }

    #[test]
    fn test_from_deploy_and_require() {
        let set = ModelWeightSet::from_deploy(&deploy()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.require(&["model", "vocab"]).is_ok());

        let err = set.require(&["model", "tokenizer"]).unwrap_err();
        assert!(err.to_string().contains("tokenizer"));
    }

    #[test]
    fn test_invalid_source_names_the_slot() {
        let mut deploy = ModelDeployConfig::default();
        deploy.weights.insert(
            "shards".to_string(),
            WeightSource::Http(HttpWeight { url: None, urls: None }),
        );
        let err = ModelWeightSet::from_deploy(&deploy).unwrap_err();
        assert!(err.to_string().contains("shards"));
    }

    #[tokio::test]
    async fn test_materialize_weight_set() {
        let buckets = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(buckets.path().join("weights/clf")).unwrap();
        std::fs::write(buckets.path().join("weights/clf/model.pt"), vec![0u8; 64]).unwrap();
        std::fs::write(buckets.path().join("weights/clf/vocab.txt"), b"a\nb\n").unwrap();

        let root = tempfile::tempdir().unwrap();
        let fetchers = FetcherSet::new().with(SourceFetcher::ObjectStore(ObjectStoreFetcher::new(
            Arc::new(FsObjectStore::new(buckets.path())),
        )));
        let cache = ContentCache::open(root.path(), 1_000_000, fetchers).await.unwrap();

        let set = ModelWeightSet::from_deploy(&deploy()).unwrap();
        let paths = materialize_weight_set(&cache, &set).await.unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read(&paths["vocab"]).unwrap(), b"a\nb\n");
        assert!(paths["model"].starts_with(root.path()));
    }

    #[tokio::test]
    async fn test_one_failing_slot_fails_the_set() {
        let buckets = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(buckets.path().join("weights/clf")).unwrap();
        std::fs::write(buckets.path().join("weights/clf/model.pt"), vec![0u8; 64]).unwrap();

        let root = tempfile::tempdir().unwrap();
        let fetchers = FetcherSet::new().with(SourceFetcher::ObjectStore(ObjectStoreFetcher::new(
            Arc::new(FsObjectStore::new(buckets.path())),
        )));
        let cache = ContentCache::open(root.path(), 1_000_000, fetchers).await.unwrap();

        let set = ModelWeightSet::from_deploy(&deploy()).unwrap();
        let err = materialize_weight_set(&cache, &set).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
