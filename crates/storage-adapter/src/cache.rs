//! Content cache implementation
//!
//! The cache owns a root directory that mirrors [`CachePath`] exactly and an
//! in-memory index of fully materialized entries. A single byte budget spans
//! every source kind. Fetches land in the staging area and are renamed into
//! place, and evicted entries are renamed back out into staging before their
//! files are deleted. Only renames happen under the index lock, so the index
//! and the disk agree whenever the lock is free and a crash can never leave a
//! half-deleted entry at a cache path.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use common::error::{CacheError, Error, Result};
use common::types::SourceKind;
use common::utils::format_bytes;
use crate::coordinator::FetchCoordinator;
use crate::fetch::FetcherSet;
use crate::filesystem::{
    exists_no_follow, install, modified_time, path_size, prune_empty_parents, touch, Staging,
};
use crate::key::{entry_depth, ArtifactKey, CachePath};

/// Name of the payload inside a fetch's scratch directory
const PAYLOAD: &str = "payload";

/// Name an unindexed leftover is moved to inside a fetch's scratch directory
const DISPLACED: &str = "displaced";

/// One fully materialized artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cache-relative path
    pub cache_path: CachePath,

    /// Source kind the artifact came from
    pub source_kind: SourceKind,

    /// Bytes on disk, summed over all files for directories
    pub size_bytes: u64,

    /// Whether the entry is a directory
    pub is_directory: bool,

    /// Last time the entry was resolved
    pub last_accessed_at: DateTime<Utc>,

    /// Recency order; larger is more recent
    pub access_seq: u64,
}

/// Snapshot of cache usage and counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub entry_count: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of resolves served from the index
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Index of materialized entries
#[derive(Debug)]
struct CacheState {
    /// Sum of all entry sizes
    total_bytes_used: u64,

    /// Byte budget
    max_bytes_budget: u64,

    /// Entries by cache path
    entries: HashMap<CachePath, CacheEntry>,

    /// Next recency sequence number
    next_seq: u64,
}

impl CacheState {
    fn new(max_bytes_budget: u64) -> Self {
        Self {
            total_bytes_used: 0,
            max_bytes_budget,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Marks an entry as just accessed, returning its new sequence number
    fn touch(&mut self, cache_path: &CachePath) -> Option<u64> {
        let seq = self.next_seq();
        let entry = self.entries.get_mut(cache_path)?;
        entry.last_accessed_at = Utc::now();
        entry.access_seq = seq;
        Some(seq)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes_used += entry.size_bytes;
        if let Some(previous) = self.entries.insert(entry.cache_path.clone(), entry) {
            self.total_bytes_used -= previous.size_bytes;
        }
    }

    fn remove(&mut self, cache_path: &CachePath) -> Option<CacheEntry> {
        let entry = self.entries.remove(cache_path)?;
        self.total_bytes_used -= entry.size_bytes;
        Some(entry)
    }

    /// Entries oldest first
    fn by_recency(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.access_seq);
        entries
    }

    fn over_budget(&self) -> bool {
        self.total_bytes_used > self.max_bytes_budget
    }
}

/// Result of one eviction pass
///
/// `retired` holds the evicted files, already detached from the cache tree.
/// Dropping the pass deletes them, so drop it only after the index lock is
/// released.
#[derive(Debug, Default)]
struct EvictionPass {
    freed_bytes: u64,
    evicted: usize,
    blocked: Option<CacheError>,
    retired: Vec<TempDir>,
}

struct CacheInner {
    /// Cache root directory
    root: PathBuf,

    /// Staging area below the root
    staging: Staging,

    /// Fetch backends
    fetchers: FetcherSet,

    /// Fetch deduplication
    coordinator: FetchCoordinator,

    /// Entry index
    state: Mutex<CacheState>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Size-bounded LRU cache of remote weight artifacts
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<CacheInner>,
}

impl ContentCache {
    /// Opens a cache at `root`
    ///
    /// Leftover staging data is deleted, the index is rebuilt from the
    /// directory tree using modification times as recency, and the cache is
    /// then evicted down to `max_bytes`.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64, fetchers: FetcherSet) -> Result<Self> {
        let root = root.into();
        let staging = Staging::new(&root);

        let inner = Arc::new(CacheInner {
            root: root.clone(),
            staging,
            fetchers,
            coordinator: FetchCoordinator::new(),
            state: Mutex::new(CacheState::new(max_bytes)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        let recovered = inner.clone();
        let pass = tokio::task::spawn_blocking(move || recovered.recover())
            .await
            .map_err(|e| Error::Internal(format!("cache recovery task failed: {}", e)))??;

        let cache = Self { inner };
        let stats = cache.stats();
        info!(
            root = %cache.root().display(),
            entries = stats.entry_count,
            used = %format_bytes(stats.total_bytes),
            budget = %format_bytes(stats.max_bytes),
            evicted = pass.evicted,
            freed = %format_bytes(pass.freed_bytes),
            "cache opened"
        );
        Ok(cache)
    }

    /// Ensures the artifact is on disk and returns its local path
    ///
    /// Hits refresh recency. Misses go through the fetch coordinator, so
    /// concurrent callers for the same key share one fetch. A failed fetch
    /// leaves nothing behind and the next call starts over.
    ///
    /// Each call counts exactly once: a caller that starts the fetch is
    /// counted by the fetch task after its own index re-check, and a caller
    /// that joins a fetch already in flight counts as a miss.
    pub async fn materialize(&self, key: &ArtifactKey) -> Result<PathBuf> {
        if let Some(path) = self.inner.hit_blocking(key).await? {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(path);
        }

        let mut started = false;
        let inner = self.inner.clone();
        let owned = key.clone();
        let result = self
            .inner
            .coordinator
            .resolve(key, || {
                started = true;
                async move { inner.fetch_and_insert(owned).await }
            })
            .await;

        if !started {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Returns the local path of an indexed artifact without fetching
    ///
    /// Counts as a hit or a miss and refreshes recency on a hit. Checks the
    /// file system on the calling thread.
    pub fn lookup(&self, key: &ArtifactKey) -> Option<PathBuf> {
        let path = self.inner.hit(key);
        let counter = if path.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        path
    }

    /// Whether the artifact is indexed; does not touch recency or counters
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.inner.state.lock().entries.contains_key(key.cache_path())
    }

    /// Removes one artifact from the index and the disk
    ///
    /// Returns false when it was not cached.
    pub async fn remove(&self, key: &ArtifactKey) -> Result<bool> {
        let inner = self.inner.clone();
        let cache_path = key.cache_path().clone();
        tokio::task::spawn_blocking(move || inner.remove_entry(&cache_path))
            .await
            .map_err(|e| Error::Internal(format!("cache remove task failed: {}", e)))?
    }

    /// Removes every entry, returning `(bytes_freed, entries_removed)`
    ///
    /// Waits for in-flight fetches to settle first so none of them lands
    /// after the wipe. Hit and miss counters are reset.
    pub async fn clear(&self) -> Result<(u64, usize)> {
        self.inner.coordinator.settle().await;

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.clear_all())
            .await
            .map_err(|e| Error::Internal(format!("cache clear task failed: {}", e)))?
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            total_bytes: state.total_bytes_used,
            entry_count: state.entries.len(),
            max_bytes: state.max_bytes_budget,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of all entries, least recently used first
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner
            .state
            .lock()
            .by_recency()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.state.lock().max_bytes_budget
    }

    /// Local path an artifact materializes at, whether cached or not
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        key.cache_path().under(&self.inner.root)
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.inner.coordinator
    }
}

impl CacheInner {
    /// Index lookup with recency refresh
    ///
    /// The lock covers only the index; the disk check and the mtime refresh
    /// happen after it is released. An indexed entry whose path has
    /// disappeared from disk is dropped from the index, unless it was
    /// accessed again in the meantime, and reported as a miss.
    fn hit(&self, key: &ArtifactKey) -> Option<PathBuf> {
        let cache_path = key.cache_path();
        let seq = self.state.lock().touch(cache_path)?;

        let target = cache_path.under(&self.root);
        if !target.exists() {
            let mut state = self.state.lock();
            if state.entries.get(cache_path).map(|e| e.access_seq) == Some(seq) {
                warn!(cache_path = %cache_path, "indexed entry missing on disk; dropping");
                state.remove(cache_path);
            }
            return None;
        }

        touch(&target);
        debug!(cache_path = %cache_path, "cache_hit");
        Some(target)
    }

    async fn hit_blocking(self: &Arc<Self>, key: &ArtifactKey) -> Result<Option<PathBuf>> {
        let inner = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || inner.hit(&key))
            .await
            .map_err(|e| Error::Internal(format!("cache lookup task failed: {}", e)))
    }

    /// Fetches a missing artifact and indexes it
    async fn fetch_and_insert(self: Arc<Self>, key: ArtifactKey) -> Result<PathBuf> {
        // a previous shared fetch may have finished after this caller's miss
        if let Some(path) = self.hit_blocking(&key).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(path);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        info!(source = %key, cache_path = %key.cache_path(), "downloading");
        let started = Instant::now();

        let scratch = self.staging.scratch()?;
        let payload = scratch.path().join(PAYLOAD);

        let fetched = match self.fetchers.fetch(&key, &payload).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(source = %key, cache_path = %key.cache_path(), error = %e, "fetch_failed");
                return Err(e);
            }
        };

        let inner = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = inner.commit(&key, &scratch, fetched, started);
            drop(scratch);
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("cache commit task failed: {}", e)))?
    }

    /// Moves a staged payload into place, indexes it and enforces the budget
    ///
    /// Sizing happens before the lock is taken and evicted files are deleted
    /// after it is released.
    fn commit(&self, key: &ArtifactKey, scratch: &TempDir, fetched: u64, started: Instant) -> Result<PathBuf> {
        let payload = scratch.path().join(PAYLOAD);
        let size_bytes = path_size(&payload)?;
        if size_bytes != fetched {
            debug!(cache_path = %key.cache_path(), fetched, measured = size_bytes, "size differs from fetcher report");
        }

        let target = key.cache_path().under(&self.root);
        let (pass, budget_bytes) = {
            let mut state = self.state.lock();

            install(&payload, &target, &scratch.path().join(DISPLACED))?;

            let access_seq = state.next_seq();
            state.insert(CacheEntry {
                cache_path: key.cache_path().clone(),
                source_kind: key.source_kind(),
                size_bytes,
                is_directory: key.is_directory(),
                last_accessed_at: Utc::now(),
                access_seq,
            });

            let pass = self.evict_locked(&mut state, Some(key.cache_path()));
            (pass, state.max_bytes_budget)
        };

        info!(
            source = %key,
            cache_path = %key.cache_path(),
            size = %format_bytes(size_bytes),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "downloaded"
        );
        if let Some(blocked) = &pass.blocked {
            warn!(error = %blocked, "eviction incomplete");
        }
        drop(pass);

        if size_bytes > budget_bytes {
            return Err(CacheError::BudgetExceededUnrecoverable {
                cache_path: key.cache_path().to_string(),
                size_bytes,
                budget_bytes,
            }
            .into());
        }

        Ok(target)
    }

    /// Detaches an entry's files from the cache tree
    ///
    /// The files are renamed into a fresh staging directory, which deletes
    /// them when dropped. `None` when nothing is on disk at the path.
    fn retire(&self, cache_path: &CachePath) -> io::Result<Option<TempDir>> {
        let path = cache_path.under(&self.root);
        if !exists_no_follow(&path)? {
            return Ok(None);
        }

        let retired = self.staging.retired()?;
        std::fs::rename(&path, retired.path().join(PAYLOAD))?;
        prune_empty_parents(&path, &self.root);
        Ok(Some(retired))
    }

    /// Evicts least recently used entries until the budget holds
    ///
    /// `keep` is never evicted. Entries whose files cannot be moved out stay
    /// indexed and the pass moves on to the next oldest.
    fn evict_locked(&self, state: &mut CacheState, keep: Option<&CachePath>) -> EvictionPass {
        let mut pass = EvictionPass::default();
        if !state.over_budget() {
            return pass;
        }

        let candidates: Vec<CachePath> = state
            .by_recency()
            .into_iter()
            .filter(|e| Some(&e.cache_path) != keep)
            .map(|e| e.cache_path.clone())
            .collect();

        for cache_path in candidates {
            if !state.over_budget() {
                break;
            }

            match self.retire(&cache_path) {
                Ok(retired) => {
                    pass.retired.extend(retired);
                    if let Some(entry) = state.remove(&cache_path) {
                        pass.freed_bytes += entry.size_bytes;
                        pass.evicted += 1;
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        info!(
                            cache_path = %cache_path,
                            size = %format_bytes(entry.size_bytes),
                            "evicted"
                        );
                    }
                }
                Err(e) => {
                    warn!(cache_path = %cache_path, error = %e, "eviction failed");
                    pass.blocked.get_or_insert(CacheError::EvictionBlocked {
                        cache_path: cache_path.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        pass
    }

    fn remove_entry(&self, cache_path: &CachePath) -> Result<bool> {
        let retired = {
            let mut state = self.state.lock();
            if !state.entries.contains_key(cache_path) {
                return Ok(false);
            }

            let retired = self.retire(cache_path).map_err(|e| CacheError::EvictionBlocked {
                cache_path: cache_path.to_string(),
                reason: e.to_string(),
            })?;
            state.remove(cache_path);
            retired
        };
        drop(retired);

        info!(cache_path = %cache_path, "removed");
        Ok(true)
    }

    fn clear_all(&self) -> Result<(u64, usize)> {
        let mut freed = 0u64;
        let mut removed = 0usize;
        let mut blocked = None;
        let mut retired = Vec::new();

        {
            let mut state = self.state.lock();
            let paths: Vec<CachePath> = state.entries.keys().cloned().collect();
            for cache_path in paths {
                match self.retire(&cache_path) {
                    Ok(files) => {
                        retired.extend(files);
                        if let Some(entry) = state.remove(&cache_path) {
                            freed += entry.size_bytes;
                            removed += 1;
                        }
                    }
                    Err(e) => {
                        warn!(cache_path = %cache_path, error = %e, "could not remove cache entry");
                        blocked.get_or_insert(CacheError::EvictionBlocked {
                            cache_path: cache_path.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        drop(retired);

        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);

        info!(freed = %format_bytes(freed), entries = removed, "cache cleared");

        match blocked {
            Some(err) => Err(err.into()),
            None => Ok((freed, removed)),
        }
    }

    /// Rebuilds the index from disk and evicts down to budget
    ///
    /// Resetting staging first deletes whatever a crash left there,
    /// including entries that were retired but not yet deleted.
    fn recover(&self) -> Result<EvictionPass> {
        std::fs::create_dir_all(&self.root)?;
        self.staging.reset()?;

        let mut found = Vec::new();
        for kind in SourceKind::ALL {
            let kind_dir = self.root.join(kind.as_str());
            if !kind_dir.is_dir() {
                continue;
            }
            let mut prefix = vec![kind.as_str().to_string()];
            scan_level(&kind_dir, entry_depth(kind), &mut prefix, &mut found)?;
        }

        // oldest modification first so recency order survives the restart
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut pass = {
            let mut state = self.state.lock();
            for (cache_path, path, modified) in found {
                let source_kind = match cache_path.source_kind() {
                    Some(kind) => kind,
                    None => continue,
                };
                let size_bytes = path_size(&path)?;
                let access_seq = state.next_seq();
                state.insert(CacheEntry {
                    cache_path,
                    source_kind,
                    size_bytes,
                    is_directory: path.is_dir(),
                    last_accessed_at: DateTime::<Utc>::from(modified),
                    access_seq,
                });
            }
            self.evict_locked(&mut state, None)
        };

        // deletes the evicted files
        pass.retired.clear();
        Ok(pass)
    }
}

/// Collects the entries `depth` levels below `dir`
fn scan_level(
    dir: &Path,
    depth: usize,
    prefix: &mut Vec<String>,
    found: &mut Vec<(CachePath, PathBuf, std::time::SystemTime)>,
) -> Result<()> {
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        let name = match dirent.file_name().into_string() {
            Ok(name) => name,
            Err(_) => {
                debug!(path = %path.display(), "skipping non-utf8 cache path");
                continue;
            }
        };

        prefix.push(name);
        if depth == 1 {
            found.push((CachePath::from_segments(prefix.clone()), path.clone(), modified_time(&path)));
        } else if path.is_dir() {
            scan_level(&path, depth - 1, prefix, found)?;
        } else {
            debug!(path = %path.display(), "skipping file above entry depth");
        }
        prefix.pop();
    }
    Ok(())
}
