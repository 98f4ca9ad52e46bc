//! Weight artifact storage for Model Serve
//!
//! This crate names remote weight artifacts, fetches them from object
//! stores, model hubs and plain HTTP, and keeps them in a size-bounded
//! local cache with one fetch per artifact at a time.

pub mod cache;
pub mod coordinator;
pub mod fetch;
pub mod filesystem;
pub mod key;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheStats, ContentCache};
pub use coordinator::FetchCoordinator;
pub use fetch::{
    FetcherSet, FsObjectStore, HttpFetcher, HttpHubClient, HubClient, HubFetcher,
    ObjectStoreClient, ObjectStoreFetcher, SourceFetcher,
};
pub use key::{ArtifactKey, CachePath, HttpLocator, HubLocator, Locator, ObjectStoreLocator};
