use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// Bundle advertised by the backend update check. Consumed once per install.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDescriptor {
    #[serde(default)]
    pub bundle_type: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub artifact_url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub mandatory: bool,
}

impl BundleDescriptor {
    /// Reject descriptors that are missing fields or would escape the bundle root.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        for (field, value) in [
            ("bundleType", &self.bundle_type),
            ("scopeId", &self.scope_id),
            ("version", &self.version),
        ] {
            if !is_path_segment(value) {
                return Err(RuntimeError::Validation(format!(
                    "descriptor field `{field}` must be a non-empty path segment (got `{value}`)"
                )));
            }
        }
        if self.artifact_url.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "descriptor field `artifactUrl` is required".to_string(),
            ));
        }
        if let Some(sha) = self.expected_sha256() {
            if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(RuntimeError::Validation(format!(
                    "descriptor field `sha256` is not a hex digest (got `{sha}`)"
                )));
            }
        }
        Ok(())
    }

    /// Expected digest, lower-cased; blank strings count as absent.
    #[must_use]
    pub fn expected_sha256(&self) -> Option<String> {
        self.sha256
            .as_deref()
            .map(str::trim)
            .filter(|sha| !sha.is_empty())
            .map(str::to_ascii_lowercase)
    }

    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}@{}", self.bundle_type, self.scope_id, self.version)
    }

    #[must_use]
    pub fn install_path(&self, root: &Path) -> PathBuf {
        root.join(&self.bundle_type)
            .join(&self.scope_id)
            .join(&self.version)
    }
}

fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledBundleEntry {
    pub version: String,
    pub path: PathBuf,
    pub sha256: String,
    pub installed_at: String,
}

/// Persisted catalog of installed bundles keyed by `(bundle_type, scope_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIndex {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub bundles: BTreeMap<String, BTreeMap<String, InstalledBundleEntry>>,
}

fn default_schema_version() -> u32 {
    INDEX_SCHEMA_VERSION
}

impl Default for LocalIndex {
    fn default() -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            bundles: BTreeMap::new(),
        }
    }
}

impl LocalIndex {
    #[must_use]
    pub fn entry(&self, bundle_type: &str, scope_id: &str) -> Option<&InstalledBundleEntry> {
        self.bundles.get(bundle_type)?.get(scope_id)
    }

    /// Entry whose directory still exists on disk.
    #[must_use]
    pub fn installed(&self, bundle_type: &str, scope_id: &str) -> Option<&InstalledBundleEntry> {
        self.entry(bundle_type, scope_id)
            .filter(|entry| entry.path.is_dir())
    }

    pub fn insert(&mut self, bundle_type: &str, scope_id: &str, entry: InstalledBundleEntry) {
        self.bundles
            .entry(bundle_type.to_string())
            .or_default()
            .insert(scope_id.to_string(), entry);
    }

    /// All entries as `(bundle_type, scope_id, entry)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &InstalledBundleEntry)> {
        self.bundles.iter().flat_map(|(bundle_type, scopes)| {
            scopes
                .iter()
                .map(move |(scope, entry)| (bundle_type.as_str(), scope.as_str(), entry))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bundles.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
