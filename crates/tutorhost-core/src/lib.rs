#![deny(clippy::all, warnings)]
//! Local runtime orchestration for the tutorhost desktop client: environment
//! provisioning, sidecar supervision and durable outbound sync queues.

pub mod backend;
pub mod config;
mod outcome;
pub mod process;
mod progress;
pub mod provision;
mod runtime;
mod single_flight;
pub mod supervisor;
pub mod sync_queue;

pub use backend::{host_platform, BackendClient, BundleUpdates};
pub use config::{Config, DataPaths, EnvSnapshot, GlobalOptions, SidecarConfig, SyncConfig};
pub use outcome::{
    format_status_message, to_json_response, CommandInfo, CommandStatus, ExecutionOutcome,
};
pub use progress::ProgressChannel;
pub use provision::{EnvironmentProvisioner, UpdateSource};
pub use runtime::{BundleSync, Runtime};
pub use supervisor::{HttpProbe, SidecarProbe, Supervisor, SupervisorEvent, SupervisorStatus};
pub use sync_queue::{Clock, Delivery, HttpDelivery, SyncQueue, SystemClock};
