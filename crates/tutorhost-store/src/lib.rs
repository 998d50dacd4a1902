#![deny(clippy::all, warnings)]
//! On-disk state for tutorhost: the bundle index, artifact downloads and
//! atomic bundle installation.

use std::time::Duration;

use reqwest::Client;
use tutorhost_domain::RuntimeError;

mod archive;
pub mod download;
mod index;
mod installer;

pub use download::{download_to_temp, sha256_file, DownloadedArtifact};
pub use index::{IndexStore, INDEX_FILENAME};
pub use installer::{ArtifactResolver, BundleInstaller, DirectResolver, ResolvedArtifact};

pub const USER_AGENT: &str = concat!("tutorhost/", env!("CARGO_PKG_VERSION"));

/// Shared async HTTP client with the tutorhost user agent.
///
/// # Errors
/// Returns [`RuntimeError::Network`] when the TLS backend cannot be initialized.
pub fn http_client(timeout: Duration) -> Result<Client, RuntimeError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|err| RuntimeError::network(format!("failed to build http client: {err}"), None))
}
