use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use tutorhost_domain::{BundleDescriptor, DownloadProgress, InstalledBundleEntry, RuntimeError};
use url::Url;

use crate::archive::extract_archive;
use crate::download::download_to_temp;
use crate::index::IndexStore;

/// Download location for an artifact, optionally authenticated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub url: String,
    pub bearer_token: Option<String>,
}

impl ResolvedArtifact {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
        }
    }
}

/// Exchanges opaque artifact references for concrete download URLs.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<ResolvedArtifact, RuntimeError>;
}

/// Resolver for offline use: only concrete URLs are accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectResolver;

#[async_trait]
impl ArtifactResolver for DirectResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedArtifact, RuntimeError> {
        Err(RuntimeError::Validation(format!(
            "artifact reference `{reference}` needs a backend to resolve"
        )))
    }
}

/// Downloads, verifies and atomically installs versioned bundles under
/// `root/<type>/<scope>/<version>`, then records them in the index.
pub struct BundleInstaller {
    root: PathBuf,
    tmp_dir: PathBuf,
    index: Arc<IndexStore>,
    resolver: Arc<dyn ArtifactResolver>,
    client: Client,
}

impl BundleInstaller {
    pub fn new(
        root: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        index: Arc<IndexStore>,
        resolver: Arc<dyn ArtifactResolver>,
        client: Client,
    ) -> Self {
        Self {
            root: root.into(),
            tmp_dir: tmp_dir.into(),
            index,
            resolver,
            client,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    /// Install `descriptor`, reporting download progress through `on_progress`.
    ///
    /// Nothing is left behind on failure: the temp download and the staging
    /// directory are removed and the index is only touched after the final
    /// directory is in place.
    ///
    /// # Errors
    /// `Validation`, `Network`, `Integrity`, `Extract` or `Io`.
    pub async fn install(
        &self,
        descriptor: &BundleDescriptor,
        mut on_progress: impl FnMut(DownloadProgress) + Send,
    ) -> Result<InstalledBundleEntry, RuntimeError> {
        descriptor.validate()?;
        let label = descriptor.label();
        let expected = descriptor.expected_sha256();

        if let Some(existing) = self.already_installed(descriptor, expected.as_deref()) {
            debug!(bundle = %label, path = %existing.path.display(), "bundle already installed");
            return Ok(existing);
        }

        let resolved = if is_direct_url(&descriptor.artifact_url) {
            ResolvedArtifact::direct(descriptor.artifact_url.clone())
        } else {
            self.resolver.resolve(&descriptor.artifact_url).await?
        };
        info!(bundle = %label, url = %resolved.url, "downloading bundle");
        let artifact = download_to_temp(
            &self.client,
            &resolved.url,
            resolved.bearer_token.as_deref(),
            &self.tmp_dir,
            &mut on_progress,
        )
        .await?;

        if let Some(expected) = expected {
            if !artifact.sha256.eq_ignore_ascii_case(&expected) {
                let actual = artifact.sha256.clone();
                if let Err(err) = artifact.path.close() {
                    warn!(bundle = %label, %err, "failed to remove rejected download");
                }
                return Err(RuntimeError::Integrity {
                    artifact: label,
                    expected,
                    actual,
                });
            }
        }

        let final_path = descriptor.install_path(&self.root);
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .map_err(|err| RuntimeError::io(format!("creating {}", parent.display()), &err))?;
        let stage = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&parent)
            .map_err(|err| RuntimeError::io("creating staging directory", &err))?;

        let stage_dir = stage.path().to_path_buf();
        let archive = artifact.path;
        let extract_label = label.clone();
        tokio::task::spawn_blocking(move || {
            let result = extract_archive(&archive, &stage_dir);
            drop(archive);
            result
        })
        .await
        .map_err(|err| RuntimeError::Extract {
            artifact: extract_label.clone(),
            message: format!("extraction task failed: {err}"),
        })?
        .map_err(|message| RuntimeError::Extract {
            artifact: extract_label,
            message,
        })?;

        promote(stage.keep(), &final_path, &label)?;

        let entry = InstalledBundleEntry {
            version: descriptor.version.clone(),
            path: final_path,
            sha256: artifact.sha256,
            installed_at: now_rfc3339(),
        };
        let recorded = self
            .index
            .update(|index| {
                match index.entry(&descriptor.bundle_type, &descriptor.scope_id) {
                    Some(current)
                        if current.version == entry.version && current.path == entry.path =>
                    {
                        return current.clone();
                    }
                    _ => {}
                }
                index.insert(&descriptor.bundle_type, &descriptor.scope_id, entry.clone());
                entry
            })
            .await?;
        info!(bundle = %label, path = %recorded.path.display(), "bundle installed");
        Ok(recorded)
    }

    fn already_installed(
        &self,
        descriptor: &BundleDescriptor,
        expected: Option<&str>,
    ) -> Option<InstalledBundleEntry> {
        let entry = self
            .index
            .installed(&descriptor.bundle_type, &descriptor.scope_id)?;
        if entry.version != descriptor.version {
            return None;
        }
        match expected {
            Some(sha) if !entry.sha256.eq_ignore_ascii_case(sha) => None,
            _ => Some(entry),
        }
    }
}

/// Rename the staging directory into place. If another installer got there
/// first, our copy is thrown away.
fn promote(stage: PathBuf, final_path: &Path, label: &str) -> Result<(), RuntimeError> {
    if final_path.exists() {
        debug!(bundle = %label, "install path already populated; discarding extraction");
        discard(&stage);
        return Ok(());
    }
    match fs::rename(&stage, final_path) {
        Ok(()) => Ok(()),
        Err(_) if final_path.exists() => {
            debug!(bundle = %label, "lost install race; discarding extraction");
            discard(&stage);
            Ok(())
        }
        Err(err) => {
            discard(&stage);
            Err(RuntimeError::io(
                format!("moving bundle into place at {}", final_path.display()),
                &err,
            ))
        }
    }
}

fn discard(stage: &Path) {
    if let Err(err) = fs::remove_dir_all(stage) {
        warn!(path = %stage.display(), %err, "failed to remove staging directory");
    }
}

fn is_direct_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https" | "file"))
        .unwrap_or(false)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
