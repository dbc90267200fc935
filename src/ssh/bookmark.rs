//! Security-scoped bookmarks for key files outside the app's own storage.
//!
//! A bookmark is an opaque token that resolves to a path. Reading the file
//! behind it requires explicitly starting access, and access must be stopped
//! again once the key is no longer needed. `ScopeAccess` holds that grant.

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// A bookmark resolved back to a filesystem location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBookmark {
    pub path: PathBuf,
    /// The bookmark still resolved, but should be recreated
    pub is_stale: bool,
}

/// Platform capability for resolving bookmarks and granting scoped access.
pub trait BookmarkResolver: Send + Sync {
    /// Turn bookmark bytes back into a path
    fn resolve(&self, bookmark: &[u8]) -> Result<ResolvedBookmark, String>;

    /// Start access to the resource at `path`. Returns false if denied.
    fn start_access(&self, path: &Path) -> bool;

    /// Stop access previously granted by `start_access`
    fn stop_access(&self, path: &Path);
}

/// A live access grant. Released explicitly with `release()`.
pub struct ScopeAccess {
    path: PathBuf,
    resolver: Arc<dyn BookmarkResolver>,
    active: bool,
}

impl ScopeAccess {
    /// Start access to `path`, or `None` if the resolver refuses
    pub fn start(resolver: Arc<dyn BookmarkResolver>, path: PathBuf) -> Option<Self> {
        if !resolver.start_access(&path) {
            return None;
        }
        tracing::debug!("Started scoped access to {}", path.display());
        Some(Self {
            path,
            resolver,
            active: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop access now
    pub fn release(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.resolver.stop_access(&self.path);
            tracing::debug!("Stopped scoped access to {}", self.path.display());
        }
    }
}

impl Drop for ScopeAccess {
    fn drop(&mut self) {
        if self.active {
            tracing::warn!(
                "Scoped access to {} was not released explicitly",
                self.path.display()
            );
            self.stop();
        }
    }
}

impl std::fmt::Debug for ScopeAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeAccess")
            .field("path", &self.path)
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BookmarkData {
    path: PathBuf,
    #[serde(default)]
    file_id: Option<u64>,
}

/// Portable bookmark resolver.
///
/// Bookmarks are JSON records of the canonical path plus the file's identity
/// (the inode on Unix). A bookmark whose path now holds a different file
/// still resolves, but is reported stale.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBookmarkResolver;

impl FileBookmarkResolver {
    /// Create a bookmark for an existing file
    pub fn create_bookmark(path: &Path) -> std::io::Result<Vec<u8>> {
        let path = path.canonicalize()?;
        let metadata = std::fs::metadata(&path)?;
        let data = BookmarkData {
            file_id: file_id(&metadata),
            path,
        };
        serde_json::to_vec(&data).map_err(std::io::Error::other)
    }
}

impl BookmarkResolver for FileBookmarkResolver {
    fn resolve(&self, bookmark: &[u8]) -> Result<ResolvedBookmark, String> {
        let data: BookmarkData =
            serde_json::from_slice(bookmark).map_err(|e| format!("malformed bookmark: {}", e))?;
        let metadata = std::fs::metadata(&data.path)
            .map_err(|e| format!("bookmarked file {}: {}", data.path.display(), e))?;

        let is_stale = match (data.file_id, file_id(&metadata)) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        };

        Ok(ResolvedBookmark {
            path: data.path,
            is_stale,
        })
    }

    fn start_access(&self, path: &Path) -> bool {
        std::fs::File::open(path).is_ok()
    }

    fn stop_access(&self, path: &Path) {
        tracing::trace!("Access to {} no longer needed", path.display());
    }
}

#[cfg(unix)]
fn file_id(metadata: &Metadata) -> Option<u64> {
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingResolver {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl BookmarkResolver for CountingResolver {
        fn resolve(&self, _bookmark: &[u8]) -> Result<ResolvedBookmark, String> {
            Err("unused".into())
        }

        fn start_access(&self, _path: &Path) -> bool {
            self.starts.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn stop_access(&self, _path: &Path) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_stops_access_once() {
        let resolver = Arc::new(CountingResolver::default());
        let access = ScopeAccess::start(resolver.clone(), PathBuf::from("/keys/id")).unwrap();
        assert_eq!(resolver.starts.load(Ordering::SeqCst), 1);

        access.release();
        assert_eq!(resolver.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_stops_unreleased_access() {
        let resolver = Arc::new(CountingResolver::default());
        {
            let _access = ScopeAccess::start(resolver.clone(), PathBuf::from("/keys/id")).unwrap();
        }
        assert_eq!(resolver.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_bookmark_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"key bytes").unwrap();

        let bookmark = FileBookmarkResolver::create_bookmark(&key).unwrap();
        let resolved = FileBookmarkResolver.resolve(&bookmark).unwrap();
        assert_eq!(resolved.path, key.canonicalize().unwrap());
        assert!(!resolved.is_stale);
        assert!(FileBookmarkResolver.start_access(&resolved.path));
    }

    #[cfg(unix)]
    #[test]
    fn test_replaced_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"old").unwrap();
        let bookmark = FileBookmarkResolver::create_bookmark(&key).unwrap();

        // Hold the old inode open so the replacement cannot reuse it
        let _old = std::fs::File::open(&key).unwrap();
        let replacement = dir.path().join("replacement");
        std::fs::write(&replacement, b"new").unwrap();
        std::fs::rename(&replacement, &key).unwrap();

        let resolved = FileBookmarkResolver.resolve(&bookmark).unwrap();
        assert!(resolved.is_stale);
    }

    #[test]
    fn test_missing_or_malformed_bookmark_fails() {
        assert!(FileBookmarkResolver.resolve(b"garbage").is_err());

        let missing = serde_json::to_vec(&BookmarkData {
            path: PathBuf::from("/definitely/not/here/id_rsa"),
            file_id: None,
        })
        .unwrap();
        assert!(FileBookmarkResolver.resolve(&missing).is_err());
    }
}
