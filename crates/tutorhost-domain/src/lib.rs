#![deny(clippy::all, warnings)]
//! Data model shared by the tutorhost orchestration crates.

mod bundle;
mod contract;
mod error;
mod launch;
mod phase;
mod queue;

pub use bundle::{BundleDescriptor, InstalledBundleEntry, LocalIndex, INDEX_SCHEMA_VERSION};
pub use contract::{ContractRequirements, RouteSpec, SidecarContract, REQUIRED_CONTRACT_VERSION};
pub use error::{is_retryable_status, ErrorKind, RuntimeError};
pub use launch::{
    FailureStage, LaunchInfo, PreflightPhase, RuntimeLaunchConfig, SidecarState, StartOutcome,
};
pub use phase::{DownloadProgress, PhaseEvent, ProvisioningPhase, ReadyOutcome};
pub use queue::{DeadLetterRecord, FlushSummary, QueueItem};
