use std::fmt;

use serde::{Deserialize, Serialize};

/// Stages of environment provisioning, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    Checking,
    DownloadingBase,
    InstallingBase,
    CreatingEnv,
    DownloadingCode,
    InstallingDeps,
    Done,
    Error,
}

impl ProvisioningPhase {
    /// Overall percent range `[start, end]` the phase occupies in the UI.
    #[must_use]
    pub fn range(self) -> (u8, u8) {
        match self {
            Self::Checking => (0, 5),
            Self::DownloadingBase => (5, 33),
            Self::InstallingBase => (33, 44),
            Self::CreatingEnv => (45, 54),
            Self::DownloadingCode => (55, 68),
            Self::InstallingDeps => (70, 95),
            Self::Done => (100, 100),
            Self::Error => (0, 0),
        }
    }

    /// Map a phase-local percent (0..=100) into the overall range.
    #[must_use]
    pub fn overall_percent(self, local: u8) -> u8 {
        let (start, end) = self.range();
        let local = u32::from(local.min(100));
        let span = u32::from(end - start);
        start + u8::try_from(span * local / 100).unwrap_or(end - start)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::DownloadingBase => "downloading_base",
            Self::InstallingBase => "installing_base",
            Self::CreatingEnv => "creating_env",
            Self::DownloadingCode => "downloading_code",
            Self::InstallingDeps => "installing_deps",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress event emitted while provisioning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseEvent {
    pub phase: ProvisioningPhase,
    /// Overall percent, already mapped into the phase range.
    pub percent: u8,
    /// Percent within the phase.
    pub phase_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_downloaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub status: String,
}

/// Byte-level progress of a single download.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub percent: u8,
}

impl DownloadProgress {
    #[must_use]
    pub fn new(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        let percent = match total_bytes {
            Some(total) if total > 0 => {
                let pct = bytes_downloaded.saturating_mul(100) / total;
                u8::try_from(pct.min(100)).unwrap_or(100)
            }
            _ => 0,
        };
        Self {
            bytes_downloaded,
            total_bytes,
            percent,
        }
    }
}

/// Result of `ensure_ready`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyOutcome {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<ProvisioningPhase>,
}

impl ReadyOutcome {
    #[must_use]
    pub fn ready() -> Self {
        Self {
            ready: true,
            error: None,
            failed_phase: None,
        }
    }

    pub fn failed(phase: ProvisioningPhase, error: impl Into<String>) -> Self {
        Self {
            ready: false,
            error: Some(error.into()),
            failed_phase: Some(phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_percent_stays_within_phase_range() {
        for phase in [
            ProvisioningPhase::Checking,
            ProvisioningPhase::DownloadingBase,
            ProvisioningPhase::InstallingBase,
            ProvisioningPhase::CreatingEnv,
            ProvisioningPhase::DownloadingCode,
            ProvisioningPhase::InstallingDeps,
        ] {
            let (start, end) = phase.range();
            assert_eq!(phase.overall_percent(0), start);
            assert_eq!(phase.overall_percent(100), end);
            assert_eq!(phase.overall_percent(250), end);
        }
        assert_eq!(ProvisioningPhase::DownloadingBase.overall_percent(50), 19);
    }

    #[test]
    fn download_progress_handles_unknown_totals() {
        assert_eq!(DownloadProgress::new(10, None).percent, 0);
        assert_eq!(DownloadProgress::new(50, Some(200)).percent, 25);
        assert_eq!(DownloadProgress::new(500, Some(200)).percent, 100);
    }

    #[test]
    fn phases_serialize_as_snake_case() {
        let json = serde_json::to_string(&ProvisioningPhase::DownloadingCode).unwrap();
        assert_eq!(json, "\"downloading_code\"");
    }
}
