//! Device allocation for Model Serve
//!
//! This crate tracks the compute devices found at startup and reserves
//! memory on them for model loads.

mod allocator;
mod preference;

pub use allocator::{DeviceAllocator, DeviceDescriptor};
pub use preference::DevicePreference;
