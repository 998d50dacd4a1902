use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-start launch parameters supplied by the caller.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLaunchConfig {
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    pub llm_provider: String,
    pub llm_api_key: String,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub llm_base_url: Option<String>,
}

impl fmt::Debug for RuntimeLaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLaunchConfig")
            .field("python_path", &self.python_path)
            .field("llm_provider", &self.llm_provider)
            .field("llm_api_key", &"<redacted>")
            .field("llm_model", &self.llm_model)
            .field("llm_base_url", &self.llm_base_url)
            .finish()
    }
}

/// Lifecycle state of the supervised sidecar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarState {
    Stopped,
    Starting,
    HealthCheck,
    ContractCheck,
    Running,
    Restarting,
    Failed,
}

impl SidecarState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::HealthCheck => "health_check",
            Self::ContractCheck => "contract_check",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SidecarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a start attempt gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// No usable interpreter or entrypoint was found.
    ResolveRuntime,
    /// The OS refused to spawn the process.
    Spawn,
    /// The process started but failed preflight.
    RuntimeStart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightPhase {
    Health,
    Contract,
}

impl fmt::Display for PreflightPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Health => "health",
            Self::Contract => "contract",
        })
    }
}

/// Where and how the sidecar was launched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchInfo {
    pub executable: PathBuf,
    pub executable_source: String,
    pub working_dir: PathBuf,
    pub entrypoint: PathBuf,
    pub base_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_phase: Option<PreflightPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    /// `true` when an already running sidecar passed the fast re-check.
    #[serde(default)]
    pub reused: bool,
}

impl StartOutcome {
    #[must_use]
    pub fn started(pid: Option<u32>, reused: bool) -> Self {
        Self {
            started: true,
            pid,
            reason: None,
            failure_stage: None,
            preflight_phase: None,
            stderr_tail: None,
            reused,
        }
    }

    pub fn failed(stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            started: false,
            pid: None,
            reason: Some(reason.into()),
            failure_stage: Some(stage),
            preflight_phase: None,
            stderr_tail: None,
            reused: false,
        }
    }

    #[must_use]
    pub fn with_preflight_phase(mut self, phase: PreflightPhase) -> Self {
        self.preflight_phase = Some(phase);
        self
    }

    #[must_use]
    pub fn with_stderr_tail(mut self, tail: String) -> Self {
        if !tail.is_empty() {
            self.stderr_tail = Some(tail);
        }
        self
    }
}
