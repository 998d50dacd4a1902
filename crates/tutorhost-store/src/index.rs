use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::warn;
use tutorhost_domain::{InstalledBundleEntry, LocalIndex, RuntimeError};

pub const INDEX_FILENAME: &str = "index.json";

/// Persistent catalog of installed bundles.
///
/// Reads never fail; a missing or unreadable file yields an empty index.
/// Read-modify-write goes through [`IndexStore::update`], which serializes
/// callers so interleaved installs cannot drop each other's entries.
#[derive(Debug)]
pub struct IndexStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl IndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store rooted at `<root>/index.json`.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(INDEX_FILENAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self) -> LocalIndex {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return LocalIndex::default()
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unable to read bundle index; using empty index");
                return LocalIndex::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(index) => index,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "bundle index is corrupt; using empty index");
                LocalIndex::default()
            }
        }
    }

    /// Persist the index atomically (temp file in the same directory, then rename).
    ///
    /// # Errors
    /// Returns [`RuntimeError::Io`] when the file cannot be written.
    pub fn save(&self, index: &LocalIndex) -> Result<(), RuntimeError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|err| RuntimeError::io(format!("creating {}", parent.display()), &err))?;
        let contents = serde_json::to_string_pretty(index).map_err(|err| RuntimeError::Io {
            context: "serializing bundle index".to_string(),
            message: err.to_string(),
        })?;
        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|err| RuntimeError::io("creating temporary index file", &err))?;
        tmp.write_all(contents.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| RuntimeError::io("writing temporary index file", &err))?;
        tmp.persist(&self.path).map_err(|err| {
            RuntimeError::io(format!("writing bundle index at {}", self.path.display()), &err.error)
        })?;
        Ok(())
    }

    /// Serialized read-modify-write. The index is only rewritten when `f` changed it.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Io`] when the updated index cannot be saved.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut LocalIndex) -> R,
    ) -> Result<R, RuntimeError> {
        let _guard = self.lock.lock().await;
        let before = self.get();
        let mut index = before.clone();
        let result = f(&mut index);
        if index != before {
            self.save(&index)?;
        }
        Ok(result)
    }

    /// Installed entry whose directory still exists.
    #[must_use]
    pub fn installed(&self, bundle_type: &str, scope_id: &str) -> Option<InstalledBundleEntry> {
        self.get().installed(bundle_type, scope_id).cloned()
    }
}
