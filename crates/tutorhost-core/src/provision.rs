use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};
use tutorhost_domain::{
    BundleDescriptor, InstalledBundleEntry, PhaseEvent, ProvisioningPhase, ReadyOutcome,
    RuntimeError,
};
use tutorhost_store::{download_to_temp, sha256_file, BundleInstaller};

use crate::backend::{host_platform, BackendClient, BundleUpdates};
use crate::config::{DataPaths, ProvisioningConfig};
use crate::process::{CommandRunner, CommandSpec, RunOutput};
use crate::progress::ProgressChannel;
use crate::single_flight::SingleFlight;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const OUTPUT_TAIL_CHARS: usize = 2_000;

/// Source of bundle update information.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn check_updates(
        &self,
        platform: &str,
        app_version: &str,
    ) -> Result<BundleUpdates, RuntimeError>;
}

#[async_trait]
impl UpdateSource for BackendClient {
    async fn check_updates(
        &self,
        platform: &str,
        app_version: &str,
    ) -> Result<BundleUpdates, RuntimeError> {
        BackendClient::check_updates(self, platform, app_version).await
    }
}

/// Executable whose presence marks the base runtime as installed.
#[must_use]
pub fn base_marker(base: &Path) -> PathBuf {
    if cfg!(windows) {
        base.join("Scripts").join("conda.exe")
    } else {
        base.join("bin").join("conda")
    }
}

/// Interpreter of the isolated environment.
#[must_use]
pub fn env_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

fn deps_stamp(env_dir: &Path, code_version: &str) -> PathBuf {
    env_dir.join(format!(".deps-{code_version}"))
}

/// Brings the local Python environment and sidecar code to a runnable state.
pub struct EnvironmentProvisioner {
    inner: Arc<Inner>,
    inflight: SingleFlight<ReadyOutcome>,
}

struct Inner {
    paths: DataPaths,
    settings: ProvisioningConfig,
    online: bool,
    installer: Arc<BundleInstaller>,
    updates: Arc<dyn UpdateSource>,
    runner: Arc<dyn CommandRunner>,
    client: Client,
    progress: ProgressChannel,
}

/// Which phases can be skipped, computed once per run.
#[derive(Debug)]
struct Markers {
    base: bool,
    env: bool,
    code: Option<InstalledBundleEntry>,
    deps: bool,
}

type PhaseResult<T = ()> = Result<T, (ProvisioningPhase, RuntimeError)>;

trait InPhase<T> {
    fn in_phase(self, phase: ProvisioningPhase) -> PhaseResult<T>;
}

impl<T> InPhase<T> for Result<T, RuntimeError> {
    fn in_phase(self, phase: ProvisioningPhase) -> PhaseResult<T> {
        self.map_err(|err| (phase, err))
    }
}

impl EnvironmentProvisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: DataPaths,
        settings: ProvisioningConfig,
        online: bool,
        installer: Arc<BundleInstaller>,
        updates: Arc<dyn UpdateSource>,
        runner: Arc<dyn CommandRunner>,
        client: Client,
        progress: ProgressChannel,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                paths,
                settings,
                online,
                installer,
                updates,
                runner,
                client,
                progress,
            }),
            inflight: SingleFlight::new(),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PhaseEvent> {
        self.inner.progress.subscribe()
    }

    /// Run every unfinished phase. Concurrent callers share one run, which
    /// keeps going if they stop waiting for it.
    ///
    /// Never fails; errors come back as a [`ReadyOutcome`] naming the phase.
    pub async fn ensure_ready(&self) -> ReadyOutcome {
        let inner = Arc::clone(&self.inner);
        self.inflight
            .run(async move { inner.run().await }, || {
                ReadyOutcome::failed(
                    ProvisioningPhase::Checking,
                    "provisioning task ended without a result",
                )
            })
            .await
    }
}

impl Inner {
    async fn run(&self) -> ReadyOutcome {
        match self.provision().await {
            Ok(()) => {
                self.progress.phase(ProvisioningPhase::Done).complete("ready");
                info!("environment ready");
                ReadyOutcome::ready()
            }
            Err((phase, err)) => {
                let message = err.to_string();
                warn!(%phase, kind = %err.kind(), %message, "provisioning failed");
                self.progress.emit(PhaseEvent {
                    phase: ProvisioningPhase::Error,
                    percent: 0,
                    phase_percent: 0,
                    bytes_downloaded: None,
                    total_bytes: None,
                    status: format!("{phase}: {message}"),
                });
                ReadyOutcome::failed(phase, message)
            }
        }
    }

    async fn provision(&self) -> PhaseResult {
        let mut checking = self.progress.phase(ProvisioningPhase::Checking);
        checking.report(0, "checking local runtime");
        let markers = self.inspect();
        debug!(?markers, "provisioning markers");
        checking.complete("checked");

        if markers.base {
            self.skip(ProvisioningPhase::DownloadingBase);
            self.skip(ProvisioningPhase::InstallingBase);
        } else {
            let installer = self.download_base().await?;
            self.install_base(&installer).await?;
        }

        if markers.env {
            self.skip(ProvisioningPhase::CreatingEnv);
        } else {
            self.create_env().await?;
        }

        let code = match markers.code {
            Some(entry) => {
                self.skip(ProvisioningPhase::DownloadingCode);
                entry
            }
            None => self.download_code().await?,
        };

        if markers.deps {
            self.skip(ProvisioningPhase::InstallingDeps);
        } else {
            self.install_deps(&code).await?;
        }
        Ok(())
    }

    fn inspect(&self) -> Markers {
        let base = base_marker(&self.paths.runtime_base).is_file();
        let env = env_python(&self.paths.runtime_env).is_file();
        let code = self.installer.index().installed(
            &self.settings.code_bundle_type,
            &self.settings.code_scope_id,
        );
        let deps = code
            .as_ref()
            .is_some_and(|entry| deps_stamp(&self.paths.runtime_env, &entry.version).is_file());
        Markers {
            base,
            env,
            code,
            deps,
        }
    }

    fn skip(&self, phase: ProvisioningPhase) {
        debug!(%phase, "already satisfied");
        self.progress.phase(phase).complete("already satisfied");
    }

    fn require_online(&self, phase: ProvisioningPhase, what: &str) -> PhaseResult {
        if self.online {
            Ok(())
        } else {
            Err((
                phase,
                RuntimeError::Provisioning(format!("{what} is missing and network access is disabled")),
            ))
        }
    }

    async fn download_base(&self) -> PhaseResult<PathBuf> {
        const PHASE: ProvisioningPhase = ProvisioningPhase::DownloadingBase;
        let dest = self.paths.downloads.join(installer_file_name());
        if self.reusable_installer(&dest).await {
            info!(path = %dest.display(), "reusing downloaded base runtime installer");
            self.progress.phase(PHASE).complete("reusing downloaded installer");
            return Ok(dest);
        }
        self.require_online(PHASE, "the base runtime")?;
        let url = self.settings.installer_url();
        info!(%url, "downloading base runtime installer");
        let mut tracker = self.progress.phase(PHASE);
        tracker.report(0, "downloading base runtime");
        let artifact = download_to_temp(
            &self.client,
            &url,
            None,
            &self.paths.downloads,
            &mut |progress| tracker.download(progress, "downloading base runtime"),
        )
        .await
        .in_phase(PHASE)?;

        if let Some(expected) = self.expected_installer_sha() {
            if !artifact.sha256.eq_ignore_ascii_case(expected) {
                return Err((
                    PHASE,
                    RuntimeError::Integrity {
                        artifact: url,
                        expected: expected.to_ascii_lowercase(),
                        actual: artifact.sha256,
                    },
                ));
            }
        }

        artifact.path.persist(&dest).map_err(|err| {
            (
                PHASE,
                RuntimeError::io(format!("saving installer to {}", dest.display()), &err.error),
            )
        })?;
        tracker.complete("downloaded base runtime");
        Ok(dest)
    }

    fn expected_installer_sha(&self) -> Option<&str> {
        self.settings
            .installer_sha256
            .as_deref()
            .map(str::trim)
            .filter(|sha| !sha.is_empty())
    }

    /// A fully downloaded installer left by an earlier failed install.
    async fn reusable_installer(&self, installer: &Path) -> bool {
        if !installer.is_file() {
            return false;
        }
        let Some(expected) = self.expected_installer_sha() else {
            return true;
        };
        match sha256_file(installer).await {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => true,
            Ok(actual) => {
                warn!(path = %installer.display(), %actual, "kept installer does not match the expected digest");
                if let Err(err) = fs::remove_file(installer) {
                    debug!(%err, "unable to remove mismatched installer");
                }
                false
            }
            Err(err) => {
                warn!(path = %installer.display(), %err, "unable to hash kept installer");
                false
            }
        }
    }

    async fn install_base(&self, installer: &Path) -> PhaseResult {
        const PHASE: ProvisioningPhase = ProvisioningPhase::InstallingBase;
        let target = &self.paths.runtime_base;
        let mut tracker = self.progress.phase(PHASE);
        tracker.report(0, "installing base runtime");

        // Silent installers refuse a pre-existing target, so only the parent may exist.
        if target.exists() {
            warn!(path = %target.display(), "removing incomplete base runtime");
            fs::remove_dir_all(target).map_err(|err| {
                (
                    PHASE,
                    RuntimeError::Provisioning(format!(
                        "cannot clear stale install target {}: {err}",
                        target.display()
                    )),
                )
            })?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| (PHASE, RuntimeError::io(format!("creating {}", parent.display()), &err)))?;
        }

        let spec = installer_command(installer, target);
        info!(command = %spec.display(), "running base runtime installer");
        tracker.report(10, "running installer");
        let output = self.runner.run(&spec).await.in_phase(PHASE)?;
        check_output(&output, "base runtime installer").in_phase(PHASE)?;
        let marker = base_marker(target);
        if !marker.is_file() {
            return Err((
                PHASE,
                RuntimeError::Provisioning(format!(
                    "installer reported success but {} is missing",
                    marker.display()
                )),
            ));
        }
        // Only a verified install consumes the installer.
        if let Err(err) = fs::remove_file(installer) {
            debug!(%err, "unable to remove installer");
        }
        tracker.complete("base runtime installed");
        Ok(())
    }

    async fn create_env(&self) -> PhaseResult {
        const PHASE: ProvisioningPhase = ProvisioningPhase::CreatingEnv;
        self.require_online(PHASE, "the isolated environment")?;
        let env_dir = &self.paths.runtime_env;
        let mut tracker = self.progress.phase(PHASE);
        tracker.report(0, "creating environment");
        let spec = CommandSpec::new(base_marker(&self.paths.runtime_base))
            .arg("create")
            .arg("-y")
            .arg("-p")
            .arg(env_dir.as_os_str())
            .arg(format!("python={}", self.settings.python_version));
        let output = self.runner.run(&spec).await.in_phase(PHASE)?;
        check_output(&output, "environment creation").in_phase(PHASE)?;
        let python = env_python(env_dir);
        if !python.is_file() {
            return Err((
                PHASE,
                RuntimeError::Provisioning(format!(
                    "environment created but {} is missing",
                    python.display()
                )),
            ));
        }
        tracker.complete("environment created");
        Ok(())
    }

    async fn download_code(&self) -> PhaseResult<InstalledBundleEntry> {
        const PHASE: ProvisioningPhase = ProvisioningPhase::DownloadingCode;
        self.require_online(PHASE, "the sidecar code bundle")?;
        let mut tracker = self.progress.phase(PHASE);
        tracker.report(0, "checking for sidecar code");
        let updates = self
            .updates
            .check_updates(&host_platform(), APP_VERSION)
            .await
            .in_phase(PHASE)?;
        let descriptor = self.code_descriptor(updates).ok_or_else(|| {
            (
                PHASE,
                RuntimeError::Provisioning(format!(
                    "backend offered no {}/{} bundle",
                    self.settings.code_bundle_type, self.settings.code_scope_id
                )),
            )
        })?;
        let entry = self
            .installer
            .install(&descriptor, |progress| {
                tracker.download(progress, "downloading sidecar code");
            })
            .await
            .in_phase(PHASE)?;
        tracker.complete("sidecar code installed");
        Ok(entry)
    }

    fn code_descriptor(&self, updates: BundleUpdates) -> Option<BundleDescriptor> {
        updates
            .required
            .into_iter()
            .chain(updates.optional)
            .find(|descriptor| {
                descriptor.bundle_type == self.settings.code_bundle_type
                    && descriptor.scope_id == self.settings.code_scope_id
            })
    }

    async fn install_deps(&self, code: &InstalledBundleEntry) -> PhaseResult {
        const PHASE: ProvisioningPhase = ProvisioningPhase::InstallingDeps;
        let env_dir = &self.paths.runtime_env;
        let mut tracker = self.progress.phase(PHASE);
        tracker.report(0, "installing dependencies");
        match requirements_file(&code.path) {
            Some(requirements) => {
                self.require_online(PHASE, "sidecar dependencies")?;
                let spec = CommandSpec::new(env_python(env_dir))
                    .arg("-m")
                    .arg("pip")
                    .arg("install")
                    .arg("--disable-pip-version-check")
                    .arg("-r")
                    .arg(requirements.into_os_string());
                tracker.report(10, "running pip");
                let output = self.runner.run(&spec).await.in_phase(PHASE)?;
                check_output(&output, "dependency installation").in_phase(PHASE)?;
            }
            None => debug!(path = %code.path.display(), "sidecar has no requirements file"),
        }
        let stamp = deps_stamp(env_dir, &code.version);
        fs::write(&stamp, format!("{}\n", code.sha256))
            .map_err(|err| (PHASE, RuntimeError::io(format!("writing {}", stamp.display()), &err)))?;
        tracker.complete("dependencies installed");
        Ok(())
    }
}

fn requirements_file(code_dir: &Path) -> Option<PathBuf> {
    [
        code_dir.join("requirements.txt"),
        code_dir.join("sidecar").join("requirements.txt"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

fn installer_file_name() -> &'static str {
    if cfg!(windows) {
        "base-installer.exe"
    } else {
        "base-installer.sh"
    }
}

fn installer_command(installer: &Path, target: &Path) -> CommandSpec {
    if cfg!(windows) {
        let mut dest = OsString::from("/D=");
        dest.push(target.as_os_str());
        CommandSpec::new(installer)
            .arg("/S")
            .arg("/InstallationType=JustMe")
            .arg("/RegisterPython=0")
            .arg("/AddToPath=0")
            .arg(dest)
    } else {
        CommandSpec::new("bash")
            .arg(installer.as_os_str())
            .arg("-b")
            .arg("-p")
            .arg(target.as_os_str())
    }
}

fn check_output(output: &RunOutput, what: &str) -> Result<(), RuntimeError> {
    if output.success() {
        return Ok(());
    }
    let detail = if output.stderr.trim().is_empty() {
        &output.stdout
    } else {
        &output.stderr
    };
    Err(RuntimeError::Provisioning(format!(
        "{what} exited with code {}: {}",
        output.code,
        tail_chars(detail.trim(), OUTPUT_TAIL_CHARS)
    )))
}

fn tail_chars(text: &str, limit: usize) -> &str {
    let count = text.chars().count();
    if count <= limit {
        return text;
    }
    text.char_indices()
        .nth(count - limit)
        .map_or(text, |(idx, _)| &text[idx..])
}
