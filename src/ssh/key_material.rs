//! Resolving key references into a file ssh can read with `-i`.
//!
//! Keys that already live in the app's key storage directory are used in
//! place. Everything else (bookmarked keys, keys elsewhere on disk) is copied
//! into a 0600 temp file with a random name, which is deleted again when the
//! handle is released.

use super::bookmark::{BookmarkResolver, FileBookmarkResolver, ScopeAccess};
use super::error::TunnelError;
use super::settings::TunnelSettings;
use super::types::KeyReference;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Owner read/write only
pub const STAGED_KEY_MODE: u32 = 0o600;

const STAGED_KEY_PREFIX: &str = "pgui-key-";
const BOOKMARK_LABEL: &str = "<bookmark>";

/// The key file handed to ssh, plus whatever must be cleaned up afterwards.
#[derive(Debug)]
pub struct KeyMaterialHandle {
    path: PathBuf,
    staged: Option<TempPath>,
    scope: Option<ScopeAccess>,
}

impl KeyMaterialHandle {
    /// Path to pass to ssh `-i`
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the key was copied into a temp file we own
    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Mode applied to the staged copy, if any
    pub fn mode(&self) -> Option<u32> {
        self.staged.as_ref().map(|_| STAGED_KEY_MODE)
    }

    /// True while a bookmark access grant is held
    pub fn holds_scope(&self) -> bool {
        self.scope.is_some()
    }

    /// Delete the staged copy and stop scoped access.
    ///
    /// Failures are logged; both steps always run.
    pub fn release(self) {
        if let Some(staged) = self.staged {
            let staged_path = staged.to_path_buf();
            match staged.close() {
                Ok(()) => tracing::debug!("Deleted staged key {}", staged_path.display()),
                Err(e) => {
                    tracing::warn!("Failed to delete staged key {}: {}", staged_path.display(), e)
                }
            }
        }

        if let Some(scope) = self.scope {
            scope.release();
        }
    }
}

/// Turns a `KeyReference` into a `KeyMaterialHandle`.
#[derive(Clone)]
pub struct KeyMaterialResolver {
    key_storage_dir: Option<PathBuf>,
    staging_dir: PathBuf,
    bookmarks: Arc<dyn BookmarkResolver>,
}

impl KeyMaterialResolver {
    pub fn new(settings: &TunnelSettings) -> Self {
        Self {
            key_storage_dir: settings.key_storage_dir.clone(),
            staging_dir: settings.staging_dir(),
            bookmarks: Arc::new(FileBookmarkResolver),
        }
    }

    /// Use a platform-specific bookmark resolver
    pub fn with_bookmark_resolver(mut self, resolver: Arc<dyn BookmarkResolver>) -> Self {
        self.bookmarks = resolver;
        self
    }

    pub async fn resolve(&self, key: &KeyReference) -> Result<KeyMaterialHandle, TunnelError> {
        match key {
            KeyReference::Bookmark(bookmark) => self.resolve_bookmark(bookmark).await,
            KeyReference::Path(path) => self.resolve_path(path).await,
        }
    }

    async fn resolve_bookmark(&self, bookmark: &[u8]) -> Result<KeyMaterialHandle, TunnelError> {
        let resolved = self
            .bookmarks
            .resolve(bookmark)
            .map_err(|reason| TunnelError::invalid_key(BOOKMARK_LABEL, reason))?;

        if resolved.is_stale {
            tracing::warn!(
                "Bookmark for {} is stale, continuing with the resolved path",
                resolved.path.display()
            );
        }

        let scope = ScopeAccess::start(self.bookmarks.clone(), resolved.path.clone())
            .ok_or_else(|| {
                TunnelError::invalid_key(
                    resolved.path.display().to_string(),
                    "could not start access to bookmarked key",
                )
            })?;

        let staged = match self.read_and_stage(&resolved.path).await {
            Ok(staged) => staged,
            Err(e) => {
                scope.release();
                return Err(e);
            }
        };

        Ok(KeyMaterialHandle {
            path: staged.to_path_buf(),
            staged: Some(staged),
            scope: Some(scope),
        })
    }

    async fn resolve_path(&self, raw: &str) -> Result<KeyMaterialHandle, TunnelError> {
        let path = expand_tilde(raw);

        if self.is_in_key_storage(&path) {
            if !path.is_file() {
                return Err(TunnelError::invalid_key(raw, "key file not found"));
            }
            tracing::debug!("Using stored key {} in place", path.display());
            return Ok(KeyMaterialHandle {
                path,
                staged: None,
                scope: None,
            });
        }

        let staged = self.read_and_stage(&path).await?;
        Ok(KeyMaterialHandle {
            path: staged.to_path_buf(),
            staged: Some(staged),
            scope: None,
        })
    }

    fn is_in_key_storage(&self, path: &Path) -> bool {
        let Some(storage) = &self.key_storage_dir else {
            return false;
        };
        match (path.canonicalize(), storage.canonicalize()) {
            (Ok(path), Ok(storage)) => path.starts_with(storage),
            _ => false,
        }
    }

    async fn read_and_stage(&self, source: &Path) -> Result<TempPath, TunnelError> {
        let label = source.display().to_string();
        let bytes = async_fs::read(source)
            .await
            .map_err(|e| TunnelError::invalid_key(label.clone(), e))?;

        let staged = self
            .stage(&bytes)
            .map_err(|e| TunnelError::invalid_key(label.clone(), e))?;

        tracing::debug!(
            "Staged {} bytes of key material from {} at {}",
            bytes.len(),
            label,
            staged.display()
        );
        Ok(staged)
    }

    fn stage(&self, bytes: &[u8]) -> std::io::Result<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGED_KEY_PREFIX).rand_bytes(16);
        #[cfg(unix)]
        builder.permissions(std::fs::Permissions::from_mode(STAGED_KEY_MODE));

        let mut file = builder.tempfile_in(&self.staging_dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        Ok(file.into_temp_path())
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}
