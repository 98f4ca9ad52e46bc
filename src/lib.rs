//! Main integration module for model-serve
//!
//! This module wires configuration, the weight cache, device discovery and
//! the model manager into one runtime, and is what the binary drives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use tracing::{info, warn};

use config::ServeConfig;
use hardware_profiler::{DiscoveredDevice, HardwareDetector};
use model_manager::{materialize_weight_set, LoadRequest, LoadedModel, ModelLifecycle, ModelManager, ModelRef};
use resource_manager::DeviceAllocator;
use storage_adapter::{ContentCache, FetcherSet};

/// Assembled model-serve runtime
pub struct ModelServe {
    /// Resolved configuration
    config: ServeConfig,

    /// Devices found at startup, overrides applied
    devices: Vec<DiscoveredDevice>,

    /// Model manager, which owns the cache and the allocator
    manager: Arc<ModelManager>,
}

impl ModelServe {
    /// Starts the runtime with the platform device probes
    pub async fn start(config: ServeConfig) -> Result<Self> {
        Self::start_with(config, &HardwareDetector::new()).await
    }

    /// Starts the runtime with a specific detector
    ///
    /// Opening the cache recovers entries left by a previous run and
    /// enforces the configured budget before anything is served.
    pub async fn start_with(config: ServeConfig, detector: &HardwareDetector) -> Result<Self> {
        let missing = config.missing_secrets();
        if !missing.is_empty() {
            warn!(missing = ?missing, "configured weight sources lack credentials");
        }

        let fetchers = FetcherSet::from_config(&config).context("building fetchers")?;
        let cache = ContentCache::open(config.cache.root_dir.clone(), config.cache.max_bytes, fetchers)
            .await
            .with_context(|| format!("opening cache at {}", config.cache.root_dir.display()))?;

        let devices = detector.discover(&config.devices);
        let allocator = Arc::new(DeviceAllocator::from_discovered(&devices));
        let manager = Arc::new(ModelManager::new(cache, allocator));

        info!(
            name = %config.name,
            devices = devices.len(),
            models = config.models.len(),
            "model-serve started"
        );

        Ok(Self {
            config,
            devices,
            manager,
        })
    }

    /// Materializes a configured model's weights without loading it
    pub async fn fetch_model(&self, model: &ModelRef) -> Result<BTreeMap<String, PathBuf>> {
        let request = LoadRequest::from_config(&self.config, model.clone())?;
        if request.weights.is_empty() {
            warn!(model = %model, "model has no configured weights");
        }

        let paths = materialize_weight_set(self.manager.cache(), &request.weights)
            .await
            .with_context(|| format!("fetching weights for {}", model))?;
        Ok(paths)
    }

    /// Loads a configured model through its lifecycle hooks
    pub async fn load_model(&self, model: ModelRef, lifecycle: Arc<dyn ModelLifecycle>) -> Result<Arc<LoadedModel>> {
        let name = model.to_string();
        let loaded = self
            .manager
            .load_configured(&self.config, model, lifecycle)
            .await
            .with_context(|| format!("loading {}", name))?;
        Ok(loaded)
    }

    /// Unloads every loaded model
    pub async fn shutdown(&self) -> Result<()> {
        for loaded in self.manager.loaded_models() {
            self.manager
                .unload(&loaded.model)
                .await
                .with_context(|| format!("unloading {}", loaded.model))?;
        }
        info!("model-serve stopped");
        Ok(())
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn cache(&self) -> &ContentCache {
        self.manager.cache()
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        self.manager.allocator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::error::Result as ModelResult;
    use common::types::{DeviceId, DeviceKind};
    use config::DeviceSpec;
    use hardware_profiler::DeviceProbe;
    use resource_manager::DeviceDescriptor;

    struct NoDevices;

    impl DeviceProbe for NoDevices {
        fn name(&self) -> &'static str {
            "none"
        }

        fn probe(&self) -> Vec<DiscoveredDevice> {
            Vec::new()
        }
    }

    struct Noop;

    #[async_trait]
    impl ModelLifecycle for Noop {
        async fn load(&self, _weights: &BTreeMap<String, PathBuf>, _device: &DeviceDescriptor) -> ModelResult<()> {
            Ok(())
        }
    }

    fn config(cache: &tempfile::TempDir, buckets: &tempfile::TempDir) -> ServeConfig {
        let mut config: ServeConfig = serde_json::from_str(
            r#"{
                "name": "test",
                "models": {
                    "clf": {
                        "device": "gpu",
                        "estimated_memory_bytes": 512,
                        "weights": {
                            "model": {"type": "s3", "bucket": "weights", "key": "clf/model.pt"}
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        config.cache.root_dir = cache.path().to_path_buf();
        config.cache.max_bytes = 1_000_000;
        config.object_store.mount_dir = Some(buckets.path().to_path_buf());
        config.devices = vec![DeviceSpec {
            id: "cuda:0".to_string(),
            kind: DeviceKind::Gpu,
            total_memory_bytes: 1024,
        }];
        config
    }

    #[tokio::test]
    async fn test_fetch_and_load_configured_model() {
        let cache = tempfile::tempdir().unwrap();
        let buckets = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(buckets.path().join("weights/clf")).unwrap();
        std::fs::write(buckets.path().join("weights/clf/model.pt"), vec![1u8; 16]).unwrap();

        let detector = HardwareDetector::with_probes(vec![Box::new(NoDevices)]);
        let serve = ModelServe::start_with(config(&cache, &buckets), &detector).await.unwrap();

        // the configured GPU plus the CPU that is always present
        assert_eq!(serve.devices().len(), 2);

        let model: ModelRef = "clf".parse().unwrap();
        let paths = serve.fetch_model(&model).await.unwrap();
        assert_eq!(std::fs::read(&paths["model"]).unwrap(), vec![1u8; 16]);

        let loaded = serve.load_model(model, Arc::new(Noop)).await.unwrap();
        assert_eq!(loaded.device.id, DeviceId::new("cuda:0"));
        assert_eq!(serve.cache().stats().entry_count, 1);

        serve.shutdown().await.unwrap();
        let gpu = serve.allocator().device(&DeviceId::new("cuda:0")).unwrap();
        assert_eq!(gpu.reserved_memory_bytes, 0);
    }

    #[tokio::test]
    async fn test_restart_recovers_cache() {
        let cache = tempfile::tempdir().unwrap();
        let buckets = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(buckets.path().join("weights/clf")).unwrap();
        std::fs::write(buckets.path().join("weights/clf/model.pt"), vec![1u8; 16]).unwrap();

        let detector = HardwareDetector::with_probes(vec![Box::new(NoDevices)]);
        let model: ModelRef = "clf".parse().unwrap();
        {
            let serve = ModelServe::start_with(config(&cache, &buckets), &detector).await.unwrap();
            serve.fetch_model(&model).await.unwrap();
        }

        // source gone; the cached copy must still serve
        std::fs::remove_file(buckets.path().join("weights/clf/model.pt")).unwrap();
        let serve = ModelServe::start_with(config(&cache, &buckets), &detector).await.unwrap();
        assert_eq!(serve.cache().stats().entry_count, 1);
        assert!(serve.fetch_model(&model).await.is_ok());
        assert_eq!(serve.cache().stats().hits, 1);
    }
}
