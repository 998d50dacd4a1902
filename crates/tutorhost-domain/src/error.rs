use std::fmt;

use serde::Serialize;

/// Failure taxonomy shared by every orchestration component.
///
/// Low-level components return these directly; the orchestrators fold them
/// into stage-tagged outcomes so nothing raw reaches the caller's UI layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{message}")]
    Network {
        message: String,
        status: Option<u16>,
    },
    #[error("sha256 mismatch for {artifact} (expected {expected}, got {actual})")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },
    #[error("failed to extract {artifact}: {message}")]
    Extract { artifact: String, message: String },
    #[error("{0}")]
    Provisioning(String),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("contract mismatch: {0}")]
    ContractMismatch(String),
    #[error("failed to spawn sidecar: {0}")]
    ProcessSpawn(String),
    #[error("delivery failed ({})", describe_status(*.status))]
    QueueDelivery { status: Option<u16>, retryable: bool },
    #[error("{context}: {message}")]
    Io { context: String, message: String },
}

/// Stable tag for each [`RuntimeError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Network,
    Integrity,
    Extract,
    Provisioning,
    HealthCheck,
    ContractMismatch,
    ProcessSpawn,
    QueueDelivery,
    Io,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Integrity => "integrity",
            Self::Extract => "extract",
            Self::Provisioning => "provisioning",
            Self::HealthCheck => "health_check",
            Self::ContractMismatch => "contract_mismatch",
            Self::ProcessSpawn => "process_spawn",
            Self::QueueDelivery => "queue_delivery",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuntimeError {
    pub fn network(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Network {
            message: message.into(),
            status,
        }
    }

    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Network { .. } => ErrorKind::Network,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Extract { .. } => ErrorKind::Extract,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::HealthCheck(_) => ErrorKind::HealthCheck,
            Self::ContractMismatch(_) => ErrorKind::ContractMismatch,
            Self::ProcessSpawn(_) => ErrorKind::ProcessSpawn,
            Self::QueueDelivery { .. } => ErrorKind::QueueDelivery,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Whether repeating the same operation later can reasonably succeed.
    ///
    /// Checksum and contract mismatches count as retryable: a fresh download
    /// or a restarted sidecar may fix them. Validation errors never do.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Network { status, .. } => status.map_or(true, is_retryable_status),
            Self::QueueDelivery { retryable, .. } => *retryable,
            Self::Integrity { .. }
            | Self::Extract { .. }
            | Self::Provisioning(_)
            | Self::HealthCheck(_)
            | Self::ContractMismatch(_)
            | Self::ProcessSpawn(_)
            | Self::Io { .. } => true,
        }
    }
}

/// `429` and every `5xx` are transient; any other `4xx` is final.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    !(400..500).contains(&status) || status == 429
}

fn describe_status(status: Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "network error".to_string(),
    }
}
