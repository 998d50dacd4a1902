use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONFIG_FILENAME: &str = "config.json";
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOptions {
    pub quiet: bool,
    pub verbose: u8,
    pub trace: bool,
    pub json: bool,
    pub offline: bool,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[must_use]
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Unset or truthy counts as enabled; `0`, `false`, `no`, `off` and empty disable.
    #[must_use]
    pub fn flag_or_default(&self, key: &str, default: bool) -> bool {
        match self.var(key) {
            Some(value) => {
                let lowered = value.trim().to_ascii_lowercase();
                !matches!(lowered.as_str(), "0" | "false" | "no" | "off" | "")
            }
            None => default,
        }
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Runtime configuration: `<root>/config.json` with environment overrides.
///
/// Every section falls back to its defaults field by field, so a partial or
/// older file keeps working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub backend: BackendConfig,
    pub provisioning: ProvisioningConfig,
    pub sidecar: SidecarConfig,
    pub sync: SyncConfig,
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(skip)]
    pub online: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            backend: BackendConfig::default(),
            provisioning: ProvisioningConfig::default(),
            sidecar: SidecarConfig::default(),
            sync: SyncConfig::default(),
            root: PathBuf::new(),
            online: true,
        }
    }
}

impl Config {
    /// Load from the process environment, optionally forcing the data root.
    ///
    /// # Errors
    /// Returns an error when no data root can be determined or an override
    /// variable holds an invalid value.
    pub fn load(root_override: Option<&Path>) -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture(), root_override)
    }

    /// Load for a CLI invocation; `--offline` wins over `TUTORHOST_ONLINE`.
    ///
    /// # Errors
    /// Same as [`Config::load`].
    pub fn for_invocation(options: &GlobalOptions) -> Result<Self> {
        let mut config = Self::load(options.root.as_deref())?;
        if options.offline {
            config.online = false;
        }
        Ok(config)
    }

    pub fn from_snapshot(snapshot: &EnvSnapshot, root_override: Option<&Path>) -> Result<Self> {
        let root = resolve_root(snapshot, root_override)?;
        let mut config = read_config_file(&root.join(CONFIG_FILENAME));
        config.root = root;
        config.online = snapshot.flag_or_default("TUTORHOST_ONLINE", true);
        if let Some(url) = snapshot.var("TUTORHOST_BACKEND_URL").filter(|v| !v.is_empty()) {
            config.backend.base_url = url.to_string();
        }
        if let Some(python) = snapshot.var("TUTORHOST_SIDECAR_PYTHON").filter(|v| !v.is_empty()) {
            config.sidecar.python = Some(PathBuf::from(python));
        }
        if let Some(port) = snapshot.var("TUTORHOST_SIDECAR_PORT") {
            config.sidecar.port = port
                .trim()
                .parse()
                .with_context(|| format!("TUTORHOST_SIDECAR_PORT must be a port number, got `{port}`"))?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.root)
    }
}

fn resolve_root(snapshot: &EnvSnapshot, root_override: Option<&Path>) -> Result<PathBuf> {
    if let Some(root) = root_override {
        return Ok(root.to_path_buf());
    }
    if let Some(home) = snapshot.var("TUTORHOST_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs_next::data_dir()
        .map(|dir| dir.join("tutorhost"))
        .ok_or_else(|| anyhow!("unable to determine a data directory; set TUTORHOST_HOME"))
}

fn read_config_file(path: &Path) -> Config {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Config::default(),
        Err(err) => {
            warn!(path = %path.display(), %err, "unable to read config; using defaults");
            return Config::default();
        }
    };
    match serde_json::from_str::<Config>(&contents) {
        Ok(config) => {
            if config.schema_version > CONFIG_SCHEMA_VERSION {
                warn!(
                    path = %path.display(),
                    found = config.schema_version,
                    supported = CONFIG_SCHEMA_VERSION,
                    "config was written by a newer version; unknown settings are ignored"
                );
            }
            config
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "invalid config; using defaults");
            Config::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Silent base-runtime installer; defaults to the Miniforge build for this host.
    pub installer_url: Option<String>,
    pub installer_sha256: Option<String>,
    pub python_version: String,
    pub code_bundle_type: String,
    pub code_scope_id: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            installer_url: None,
            installer_sha256: None,
            python_version: "3.11".to_string(),
            code_bundle_type: "sidecar".to_string(),
            code_scope_id: "default".to_string(),
        }
    }
}

impl ProvisioningConfig {
    #[must_use]
    pub fn installer_url(&self) -> String {
        self.installer_url
            .clone()
            .unwrap_or_else(default_installer_url)
    }
}

fn default_installer_url() -> String {
    let (os, ext) = match env::consts::OS {
        "macos" => ("MacOSX", "sh"),
        "windows" => ("Windows", "exe"),
        _ => ("Linux", "sh"),
    };
    let arch = match env::consts::ARCH {
        "aarch64" if os == "Linux" => "aarch64",
        "aarch64" => "arm64",
        _ => "x86_64",
    };
    format!(
        "https://github.com/conda-forge/miniforge/releases/latest/download/Miniforge3-{os}-{arch}.{ext}"
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Explicit interpreter; `TUTORHOST_SIDECAR_PYTHON` fills it when unset here.
    pub python: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub entrypoint: String,
    pub working_dir: Option<PathBuf>,
    pub health_timeout_ms: u64,
    pub fast_health_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub max_auto_restarts: u32,
    pub stderr_tail_chars: usize,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            python: None,
            host: "127.0.0.1".to_string(),
            port: 8765,
            entrypoint: "main.py".to_string(),
            working_dir: None,
            health_timeout_ms: 12_000,
            fast_health_timeout_ms: 1_200,
            poll_interval_ms: 250,
            restart_delay_ms: 1_000,
            max_auto_restarts: 2,
            stderr_tail_chars: 8_000,
        }
    }
}

impl SidecarConfig {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            jitter_ms: 1_000,
            max_retries: 8,
        }
    }
}

/// Fixed layout under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub index: PathBuf,
    pub bundles: PathBuf,
    pub tmp: PathBuf,
    pub sync: PathBuf,
    pub runtime_base: PathBuf,
    pub runtime_env: PathBuf,
    pub downloads: PathBuf,
    pub sessions: PathBuf,
}

impl DataPaths {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            index: root.join(tutorhost_store::INDEX_FILENAME),
            bundles: root.join("bundles"),
            tmp: root.join(".tmp"),
            sync: root.join("sync"),
            runtime_base: root.join("runtime").join("base"),
            runtime_env: root.join("runtime").join("env"),
            downloads: root.join("downloads"),
            sessions: root.join("sessions"),
        }
    }
}
