//! Filesystem helpers for the cache
//!
//! Fetches are written into a private staging directory under the cache root
//! and only renamed into place once complete. The staging directory lives on
//! the same filesystem as the cache so the final rename is atomic.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

/// Name of the staging directory below the cache root
pub const STAGING_DIR: &str = ".staging";

/// Staging area for in-progress fetches
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            dir: cache_root.join(STAGING_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Removes anything left behind by a previous process and recreates the directory
    pub fn reset(&self) -> io::Result<()> {
        remove_path(&self.dir)?;
        std::fs::create_dir_all(&self.dir)
    }

    /// Creates a fresh private directory for one fetch
    ///
    /// The directory and anything left in it are deleted when the returned
    /// handle is dropped, which covers failed and abandoned fetches.
    pub fn scratch(&self) -> io::Result<TempDir> {
        self.private_dir("fetch-")
    }

    /// Creates a directory to move a retired entry into
    ///
    /// The entry's files are deleted when the handle is dropped; whatever a
    /// crash leaves behind is purged by the next [`reset`](Self::reset).
    pub fn retired(&self) -> io::Result<TempDir> {
        self.private_dir("evict-")
    }

    fn private_dir(&self, prefix: &str) -> io::Result<TempDir> {
        std::fs::create_dir_all(&self.dir)?;
        tempfile::Builder::new().prefix(prefix).tempdir_in(&self.dir)
    }
}

/// Total size of a file, or of every file below a directory
pub fn path_size(path: &Path) -> io::Result<u64> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory walk failed"))
        })?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

/// Removes a file or directory tree; a missing path is not an error
pub fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Removes now-empty directories between `path` and `stop_at` (exclusive)
pub fn prune_empty_parents(path: &Path, stop_at: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        // fails on non-empty directories, which ends the walk
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Moves a fully staged payload to its final cache location
///
/// Anything already at `target` is an unindexed leftover; it is renamed to
/// `displaced` rather than deleted in place. Only renames and directory
/// creation happen here.
pub fn install(staged: &Path, target: &Path, displaced: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if exists_no_follow(target)? {
        std::fs::rename(target, displaced)?;
    }
    std::fs::rename(staged, target)
}

/// Whether anything, including a dangling symlink, is at `path`
pub fn exists_no_follow(path: &Path) -> io::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort modification time refresh so recency survives a restart
pub fn touch(path: &Path) {
    let result = std::fs::File::open(path).and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "could not refresh modification time");
    }
}

/// Modification time, falling back to the epoch
pub fn modified_time(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Checks that a relative path from a remote listing stays inside its parent
pub fn is_safe_relative(relative: &str) -> bool {
    !relative.is_empty()
        && !relative.starts_with('/')
        && relative
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_size_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, vec![0u8; 10]).unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        std::fs::write(dir.path().join("nested/deeper/b.bin"), vec![0u8; 5]).unwrap();

        assert_eq!(path_size(&file).unwrap(), 10);
        assert_eq!(path_size(dir.path()).unwrap(), 15);
    }

    #[test]
    fn test_remove_path_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir_all(sub.join("x")).unwrap();
        std::fs::write(sub.join("x/f"), b"data").unwrap();

        remove_path(&sub).unwrap();
        assert!(!sub.exists());
        remove_path(&sub).unwrap();
    }

    #[test]
    fn test_install_replaces_leftover() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        let target = dir.path().join("kind/bucket/key");
        std::fs::write(&staged, b"new").unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"stale").unwrap();

        let displaced = dir.path().join("displaced");
        install(&staged, &target, &displaced).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(std::fs::read(&displaced).unwrap(), b"stale");
        assert!(!staged.exists());
    }

    #[test]
    fn test_prune_empty_parents_stops_at_root() {
        let root = tempfile::tempdir().unwrap();
        let leaf = root.path().join("hub/repo/rev/file");
        std::fs::create_dir_all(leaf.parent().unwrap()).unwrap();
        std::fs::create_dir_all(root.path().join("hub/other")).unwrap();

        prune_empty_parents(&leaf, root.path());
        assert!(!root.path().join("hub/repo").exists());
        assert!(root.path().join("hub/other").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_scratch_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let staging = Staging::new(root.path());
        let scratch = staging.scratch().unwrap();
        let inner = scratch.path().to_path_buf();
        std::fs::write(inner.join("partial"), b"half").unwrap();
        drop(scratch);
        assert!(!inner.exists());
        assert!(staging.dir().exists());
    }

    #[test]
    fn test_retired_dir_deletes_moved_entry_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let entry = root.path().join("object_store/b/prefix%2F");
        std::fs::create_dir_all(entry.join("nested")).unwrap();
        std::fs::write(entry.join("nested/w.bin"), vec![0u8; 8]).unwrap();

        let staging = Staging::new(root.path());
        let retired = staging.retired().unwrap();
        let moved = retired.path().join("payload");
        std::fs::rename(&entry, &moved).unwrap();
        assert!(!entry.exists());
        assert!(moved.join("nested/w.bin").is_file());

        drop(retired);
        assert!(!moved.exists());
        assert_eq!(std::fs::read_dir(staging.dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_is_safe_relative() {
        assert!(is_safe_relative("a/b.bin"));
        assert!(!is_safe_relative("../escape"));
        assert!(!is_safe_relative("/abs"));
        assert!(!is_safe_relative("a//b"));
        assert!(!is_safe_relative(""));
    }
}
