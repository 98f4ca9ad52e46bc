//! Model loader implementation
//!
//! This module runs a model load end to end: weights are materialized
//! through the content cache, a device is reserved, and the model's own
//! `load` hook is called. Loads of one model are serialized and idempotent;
//! unloading calls the model's hook and gives the reservation back.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::error::Result;
use config::ServeConfig;
use resource_manager::{DeviceAllocator, DeviceDescriptor, DevicePreference};
use storage_adapter::ContentCache;
use crate::lifecycle::{ModelLifecycle, ModelRef};
use crate::weights::{materialize_weight_set, ModelWeightSet};

/// Everything needed to load one model
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Model being loaded
    pub model: ModelRef,

    /// Weight slots
    pub weights: ModelWeightSet,

    /// Slots that must be present in `weights`
    pub required_slots: Vec<String>,

    /// Memory to reserve on the chosen device
    pub estimated_memory_bytes: u64,

    /// Device preference
    pub preference: DevicePreference,
}

impl LoadRequest {
    pub fn new(model: ModelRef, weights: ModelWeightSet) -> Self {
        Self {
            model,
            weights,
            required_slots: Vec::new(),
            estimated_memory_bytes: 0,
            preference: DevicePreference::Auto,
        }
    }

    /// Builds a request from the model's deploy entry
    pub fn from_config(config: &ServeConfig, model: ModelRef) -> Result<Self> {
        let deploy = config.model_config(&model.id, model.version.as_deref());
        let weights = ModelWeightSet::from_deploy(&deploy)?;

        Ok(Self {
            model,
            weights,
            required_slots: Vec::new(),
            estimated_memory_bytes: deploy.estimated_memory_bytes,
            preference: DevicePreference::from(deploy.device.as_str()),
        })
    }

    pub fn with_required_slots<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_slots = slots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_memory(mut self, estimated_memory_bytes: u64) -> Self {
        self.estimated_memory_bytes = estimated_memory_bytes;
        self
    }

    pub fn with_preference(mut self, preference: DevicePreference) -> Self {
        self.preference = preference;
        self
    }
}

/// A model that finished loading
pub struct LoadedModel {
    /// Model reference
    pub model: ModelRef,

    /// Device the model was placed on, as of the allocation
    pub device: DeviceDescriptor,

    /// Memory reserved on the device for this model
    pub reserved_memory_bytes: u64,

    /// Local path per weight slot
    pub weights: BTreeMap<String, PathBuf>,

    /// Load timestamp
    pub loaded_at: DateTime<Utc>,

    /// Hooks of the loaded implementation
    lifecycle: Arc<dyn ModelLifecycle>,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model", &self.model)
            .field("device", &self.device.id)
            .field("reserved_memory_bytes", &self.reserved_memory_bytes)
            .field("weights", &self.weights)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Model manager for loading and unloading models
pub struct ModelManager {
    /// Weight cache
    cache: ContentCache,

    /// Device allocator
    allocator: Arc<DeviceAllocator>,

    /// Loaded models
    loaded: DashMap<ModelRef, Arc<LoadedModel>>,

    /// Per-model locks serializing load and unload
    locks: DashMap<ModelRef, Arc<Mutex<()>>>,
}

impl ModelManager {
    /// Creates a new model manager
    pub fn new(cache: ContentCache, allocator: Arc<DeviceAllocator>) -> Self {
        Self {
            cache,
            allocator,
            loaded: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, model: &ModelRef) -> Arc<Mutex<()>> {
        self.locks.entry(model.clone()).or_default().clone()
    }

    /// Drops a model's lock once no caller holds or waits on it
    fn release_lock(&self, model: &ModelRef, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(model, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Loads a model, or returns it if it is already loaded
    ///
    /// When the model's `load` hook fails the device reservation is
    /// released and the model is not recorded as loaded.
    pub async fn load(&self, request: LoadRequest, lifecycle: Arc<dyn ModelLifecycle>) -> Result<Arc<LoadedModel>> {
        if let Some(loaded) = self.get(&request.model) {
            return Ok(loaded);
        }

        let model = request.model.clone();
        let lock = self.lock_for(&model);
        let result = {
            let _guard = lock.lock().await;
            self.load_locked(request, lifecycle).await
        };
        self.release_lock(&model, lock);
        result
    }

    async fn load_locked(&self, request: LoadRequest, lifecycle: Arc<dyn ModelLifecycle>) -> Result<Arc<LoadedModel>> {
        // Check again after acquiring lock
        if let Some(loaded) = self.get(&request.model) {
            return Ok(loaded);
        }

        info!(model = %request.model, slots = request.weights.len(), "model_loading");
        let started = Instant::now();

        let required: Vec<&str> = request.required_slots.iter().map(String::as_str).collect();
        request.weights.require(&required)?;

        let weights = materialize_weight_set(&self.cache, &request.weights).await?;

        let device = self
            .allocator
            .allocate_preference(&request.preference, request.estimated_memory_bytes)?;

        if let Err(e) = lifecycle.load(&weights, &device).await {
            warn!(model = %request.model, device = %device.id, error = %e, "model load hook failed");
            if let Err(release_error) = self.allocator.release(&device.id, request.estimated_memory_bytes) {
                warn!(device = %device.id, error = %release_error, "could not release device");
            }
            return Err(e);
        }

        let loaded = Arc::new(LoadedModel {
            model: request.model.clone(),
            device,
            reserved_memory_bytes: request.estimated_memory_bytes,
            weights,
            loaded_at: Utc::now(),
            lifecycle,
        });
        self.loaded.insert(request.model.clone(), loaded.clone());

        info!(
            model = %request.model,
            device = %loaded.device.id,
            ms = started.elapsed().as_millis() as u64,
            "model_loaded"
        );
        Ok(loaded)
    }

    /// Loads a model as described by its deploy entry
    pub async fn load_configured(
        &self,
        config: &ServeConfig,
        model: ModelRef,
        lifecycle: Arc<dyn ModelLifecycle>,
    ) -> Result<Arc<LoadedModel>> {
        let request = LoadRequest::from_config(config, model)?;
        self.load(request, lifecycle).await
    }

    /// Unloads a model; false when it was not loaded
    ///
    /// The device is released even if the model's `unload` hook fails, in
    /// which case the hook's error is returned afterwards.
    pub async fn unload(&self, model: &ModelRef) -> Result<bool> {
        let lock = self.lock_for(model);
        let result = {
            let _guard = lock.lock().await;
            self.unload_locked(model).await
        };
        self.release_lock(model, lock);
        result
    }

    async fn unload_locked(&self, model: &ModelRef) -> Result<bool> {
        let loaded = match self.loaded.remove(model) {
            Some((_, loaded)) => loaded,
            None => return Ok(false),
        };

        let hook = loaded.lifecycle.unload().await;
        if let Err(e) = &hook {
            warn!(model = %model, error = %e, "model unload hook failed");
        }

        self.allocator
            .release(&loaded.device.id, loaded.reserved_memory_bytes)?;

        info!(model = %model, device = %loaded.device.id, "model_unloaded");
        hook.map(|_| true)
    }

    /// Unloads every loaded version of `model_id`
    pub async fn unload_all(&self, model_id: &str) -> Result<Vec<ModelRef>> {
        let matching: Vec<ModelRef> = self
            .loaded
            .iter()
            .filter(|entry| entry.key().id == model_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut unloaded = Vec::new();
        for model in matching {
            if self.unload(&model).await? {
                unloaded.push(model);
            }
        }
        Ok(unloaded)
    }

    pub fn get(&self, model: &ModelRef) -> Option<Arc<LoadedModel>> {
        self.loaded.get(model).map(|entry| entry.value().clone())
    }

    pub fn is_loaded(&self, model: &ModelRef) -> bool {
        self.loaded.contains_key(model)
    }

    pub fn loaded_models(&self) -> Vec<Arc<LoadedModel>> {
        self.loaded.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }
}
