//! Fetch deduplication
//!
//! At most one fetch per cache path is active at a time. The first caller
//! for a path starts the fetch on its own task; every later caller, and the
//! first one, awaits a shared handle to that task. Dropping a caller's future
//! never aborts the fetch.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tracing::debug;

use common::error::{Error, Result};
use crate::key::{ArtifactKey, CachePath};

type SharedFetch = Shared<BoxFuture<'static, Result<PathBuf>>>;

/// An in-flight fetch and the callers waiting on it
struct InFlight {
    /// Key being fetched
    key: ArtifactKey,

    /// Callers that joined after the fetch started
    joined: u64,

    /// Outcome shared by every waiter
    result: SharedFetch,
}

/// Deduplicates concurrent fetches by cache path
#[derive(Clone, Default)]
pub struct FetchCoordinator {
    /// In-flight fetches
    in_flight: Arc<DashMap<CachePath, InFlight>>,

    /// Fetches started since creation
    started: Arc<AtomicU64>,
}

impl FetchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `key` through a single shared fetch
    ///
    /// When no fetch for the key is in flight, `fetch` is called once and
    /// its future runs on a new task; otherwise `fetch` is dropped unused and
    /// the caller waits for the running one. Every waiter receives the same
    /// result. The in-flight record is removed when the fetch completes, so
    /// a later call after a failure starts over.
    pub async fn resolve<F, Fut>(&self, key: &ArtifactKey, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>> + Send + 'static,
    {
        let shared = match self.in_flight.entry(key.cache_path().clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.joined += 1;
                debug!(key = %record.key, waiters = record.joined + 1, "joining in-flight fetch");
                record.result.clone()
            }
            Entry::Vacant(vacant) => {
                self.started.fetch_add(1, Ordering::Relaxed);

                let in_flight = self.in_flight.clone();
                let cache_path = key.cache_path().clone();
                let work = fetch();

                let handle = tokio::spawn(async move {
                    let result = work.await;
                    in_flight.remove(&cache_path);
                    result
                });

                let result = async move {
                    handle
                        .await
                        .map_err(|e| Error::Internal(format!("fetch task failed: {}", e)))?
                }
                .boxed()
                .shared();

                vacant.insert(InFlight {
                    key: key.clone(),
                    joined: 0,
                    result: result.clone(),
                });
                result
            }
        };

        shared.await
    }

    /// Waits until every fetch in flight at the time of the call has finished
    pub async fn settle(&self) {
        let pending: Vec<SharedFetch> = self
            .in_flight
            .iter()
            .map(|record| record.value().result.clone())
            .collect();

        if !pending.is_empty() {
            debug!(count = pending.len(), "waiting for in-flight fetches");
            join_all(pending).await;
        }
    }

    /// Whether a fetch for `key` is in flight
    pub fn is_in_flight(&self, key: &ArtifactKey) -> bool {
        self.in_flight.contains_key(key.cache_path())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn fetches_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn key() -> ArtifactKey {
        ArtifactKey::url("https://example.com/w.bin").unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let coordinator = FetchCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let calls = calls.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    coordinator
                        .resolve(&key, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(PathBuf::from("/cache/http/w"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), PathBuf::from("/cache/http/w"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.fetches_started(), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_forgotten() {
        let coordinator = FetchCoordinator::new();
        let key = key();

        let first = coordinator
            .resolve(&key, || async { Err(Error::Internal("boom".to_string())) })
            .await;
        assert!(first.is_err());
        assert!(!coordinator.is_in_flight(&key));

        let second = coordinator
            .resolve(&key, || async { Ok(PathBuf::from("/ok")) })
            .await
            .unwrap();
        assert_eq!(second, PathBuf::from("/ok"));
        assert_eq!(coordinator.fetches_started(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_originator_does_not_abort_fetch() {
        let coordinator = FetchCoordinator::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let key = key();

        let done = completed.clone();
        let originator = coordinator.resolve(&key, move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("/cache/x"))
        });
        // polling once starts the fetch, then the caller gives up
        let timed_out = tokio::time::timeout(Duration::from_millis(10), originator).await;
        assert!(timed_out.is_err());
        assert!(coordinator.is_in_flight(&key));

        let waiter = coordinator
            .resolve(&key, || async { Ok(PathBuf::from("/never")) })
            .await
            .unwrap();
        assert_eq!(waiter, PathBuf::from("/cache/x"));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_waits_for_in_flight() {
        let coordinator = FetchCoordinator::new();
        let key = key();

        let background = coordinator.clone();
        let bg_key = key.clone();
        let task = tokio::spawn(async move {
            background
                .resolve(&bg_key, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(PathBuf::from("/cache/y"))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.settle().await;
        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(task.await.unwrap().is_ok());
    }
}
