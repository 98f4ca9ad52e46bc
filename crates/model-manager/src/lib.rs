//! Model load orchestration for model-serve
//!
//! This crate ties the weight cache and the device allocator together:
//! a load materializes every weight slot, reserves a device, and hands
//! both to the model's lifecycle hooks.

pub mod lifecycle;
pub mod loader;
pub mod weights;

// Re-export commonly used types
pub use lifecycle::{ModelLifecycle, ModelRef};
pub use loader::{LoadRequest, LoadedModel, ModelManager};
pub use weights::{materialize_weight_set, ModelWeightSet};
