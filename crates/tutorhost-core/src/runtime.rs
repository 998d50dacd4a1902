use std::sync::Arc;

use tracing::{debug, info};
use tutorhost_domain::{BundleDescriptor, DownloadProgress, InstalledBundleEntry, RuntimeError};
use tutorhost_store::{ArtifactResolver, BundleInstaller, DirectResolver, IndexStore};

use crate::backend::{host_platform, BackendClient};
use crate::config::{Config, DataPaths};
use crate::process::SystemRunner;
use crate::progress::ProgressChannel;
use crate::provision::{EnvironmentProvisioner, UpdateSource};
use crate::supervisor::{HttpProbe, Supervisor};
use crate::sync_queue::{HttpDelivery, SyncQueue, SystemClock};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every long-lived component, constructed once from a [`Config`].
pub struct Runtime {
    config: Config,
    paths: DataPaths,
    index: Arc<IndexStore>,
    backend: Arc<BackendClient>,
    installer: Arc<BundleInstaller>,
    provisioner: EnvironmentProvisioner,
    supervisor: Arc<Supervisor>,
    queue: SyncQueue,
}

/// Result of installing one advertised bundle.
#[derive(Debug)]
pub struct BundleSync {
    pub descriptor: BundleDescriptor,
    pub result: Result<InstalledBundleEntry, RuntimeError>,
}

impl Runtime {
    /// # Errors
    /// Fails when the HTTP client cannot be built or the backend URL is invalid.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        let paths = config.paths();
        let client = tutorhost_store::http_client(config.backend.timeout())?;
        let index = Arc::new(IndexStore::new(&paths.index));
        let backend = Arc::new(BackendClient::new(&config.backend.base_url, client.clone())?);
        let resolver: Arc<dyn ArtifactResolver> = if config.online {
            backend.clone()
        } else {
            Arc::new(DirectResolver)
        };
        let installer = Arc::new(BundleInstaller::new(
            &paths.bundles,
            &paths.tmp,
            index.clone(),
            resolver,
            client.clone(),
        ));
        let updates: Arc<dyn UpdateSource> = backend.clone();
        let provisioner = EnvironmentProvisioner::new(
            paths.clone(),
            config.provisioning.clone(),
            config.online,
            installer.clone(),
            updates,
            Arc::new(SystemRunner),
            client.clone(),
            ProgressChannel::new(),
        );
        let code_bundle = (
            config.provisioning.code_bundle_type.clone(),
            config.provisioning.code_scope_id.clone(),
        );
        let probe = HttpProbe::new(tutorhost_store::http_client(
            std::time::Duration::from_millis(config.sidecar.health_timeout_ms.max(1)),
        )?);
        let supervisor = Supervisor::new(
            config.sidecar.clone(),
            paths.clone(),
            code_bundle,
            index.clone(),
            Arc::new(probe),
        );
        let queue = SyncQueue::new(
            &paths.sync,
            config.sync,
            Arc::new(HttpDelivery::new(client)),
            Arc::new(SystemClock),
        );
        debug!(root = %paths.root.display(), online = config.online, "runtime ready");
        Ok(Self {
            config,
            paths,
            index,
            backend,
            installer,
            provisioner,
            supervisor,
            queue,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    #[must_use]
    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    #[must_use]
    pub fn provisioner(&self) -> &EnvironmentProvisioner {
        &self.provisioner
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Backend endpoint for a sync stream.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Validation`] when the stream cannot form a URL.
    pub fn stream_endpoint(&self, stream: &str) -> Result<String, RuntimeError> {
        self.backend
            .stream_endpoint(stream)
            .map(|url| url.to_string())
    }

    /// Ask the backend for updates and install what it advertises.
    ///
    /// Each bundle is installed independently; one failure does not stop the
    /// rest.
    ///
    /// # Errors
    /// Fails only when offline or when the update check itself fails.
    pub async fn sync_bundles(
        &self,
        include_optional: bool,
        mut on_progress: impl FnMut(&BundleDescriptor, DownloadProgress) + Send,
    ) -> Result<Vec<BundleSync>, RuntimeError> {
        if !self.config.online {
            return Err(RuntimeError::network(
                "offline mode is on; bundle updates need the backend",
                None,
            ));
        }
        let updates = self
            .backend
            .check_updates(&host_platform(), APP_VERSION)
            .await?;
        let mut wanted = updates.required;
        if include_optional {
            wanted.extend(updates.optional);
        }
        info!(count = wanted.len(), "syncing bundles");

        let mut results = Vec::with_capacity(wanted.len());
        for descriptor in wanted {
            let result = self
                .installer
                .install(&descriptor, |progress| on_progress(&descriptor, progress))
                .await;
            results.push(BundleSync { descriptor, result });
        }
        Ok(results)
    }
}
