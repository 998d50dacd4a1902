use std::env;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use tutorhost_domain::{BundleDescriptor, RuntimeError};
use tutorhost_store::{ArtifactResolver, ResolvedArtifact};
use url::Url;

/// Credentials are refreshed this long before they expire.
const CREDENTIAL_SKEW: TimeDuration = TimeDuration::seconds(30);

/// Bundles the backend wants installed on this machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleUpdates {
    #[serde(default)]
    pub required: Vec<BundleDescriptor>,
    #[serde(default)]
    pub optional: Vec<BundleDescriptor>,
}

#[derive(Deserialize)]
struct ResolveResponse {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedCredential {
    token: String,
    expires_at: Option<OffsetDateTime>,
}

impl CachedCredential {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.expires_at
            .map_or(true, |expires| now + CREDENTIAL_SKEW < expires)
    }
}

/// REST client for the remote backend.
#[derive(Debug)]
pub struct BackendClient {
    base: Url,
    client: Client,
    credential: Mutex<Option<CachedCredential>>,
}

impl BackendClient {
    /// # Errors
    /// Returns [`RuntimeError::Validation`] when `base_url` is not a valid URL.
    pub fn new(base_url: &str, client: Client) -> Result<Self, RuntimeError> {
        let mut base = Url::parse(base_url).map_err(|err| {
            RuntimeError::Validation(format!("invalid backend url `{base_url}`: {err}"))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            client,
            credential: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, RuntimeError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| RuntimeError::Validation(format!("invalid endpoint `{path}`: {err}")))
    }

    /// URL of the generic POST endpoint for a sync stream.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Validation`] when the stream name cannot form a URL.
    pub fn stream_endpoint(&self, stream: &str) -> Result<Url, RuntimeError> {
        self.endpoint(&format!("api/sync/{stream}"))
    }

    /// Required and optional bundles for this platform and app version.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Network`] on transport failures or error statuses.
    pub async fn check_updates(
        &self,
        platform: &str,
        app_version: &str,
    ) -> Result<BundleUpdates, RuntimeError> {
        let mut url = self.endpoint("api/bundles/updates")?;
        url.query_pairs_mut()
            .append_pair("platform", platform)
            .append_pair("appVersion", app_version);
        let response = self.send(self.client.get(url.clone()), &url).await?;
        read_json(response, &url).await
    }

    /// Exchange an opaque artifact reference for a signed download URL.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Network`] on transport failures or error statuses.
    pub async fn resolve_reference(&self, reference: &str) -> Result<String, RuntimeError> {
        let url = self.endpoint("api/bundles/resolve")?;
        let request = self
            .client
            .post(url.clone())
            .json(&serde_json::json!({ "reference": reference }));
        let response = self.send(request, &url).await?;
        let body: ResolveResponse = read_json(response, &url).await?;
        Ok(body.url)
    }

    /// Download credential, fetched once and reused until it expires.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Network`] when the credential cannot be fetched.
    pub async fn download_credential(&self) -> Result<String, RuntimeError> {
        let mut cached = self.credential.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(credential) = cached.as_ref().filter(|c| c.is_fresh(now)) {
            return Ok(credential.token.clone());
        }
        let url = self.endpoint("api/bundles/credentials")?;
        let response = self.send(self.client.get(url.clone()), &url).await?;
        let body: CredentialsResponse = read_json(response, &url).await?;
        let expires_at = body.expires_at.as_deref().and_then(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|err| warn!(%err, value = raw, "ignoring unparseable credential expiry"))
                .ok()
        });
        debug!(expires = ?expires_at, "fetched download credential");
        let token = body.token.clone();
        *cached = Some(CachedCredential {
            token: body.token,
            expires_at,
        });
        Ok(token)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<Response, RuntimeError> {
        let response = request
            .send()
            .await
            .map_err(|err| RuntimeError::network(format!("request to {url} failed: {err}"), None))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RuntimeError::network(
                format!("unexpected response {status} from {url}"),
                Some(status.as_u16()),
            ))
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T, RuntimeError> {
    response
        .json()
        .await
        .map_err(|err| RuntimeError::network(format!("invalid response from {url}: {err}"), None))
}

#[async_trait]
impl ArtifactResolver for BackendClient {
    async fn resolve(&self, reference: &str) -> Result<ResolvedArtifact, RuntimeError> {
        let url = self.resolve_reference(reference).await?;
        let bearer_token = match self.download_credential().await {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(%err, "continuing without download credential");
                None
            }
        };
        Ok(ResolvedArtifact { url, bearer_token })
    }
}

/// Platform tag sent with update checks, e.g. `linux-x86_64`.
#[must_use]
pub fn host_platform() -> String {
    format!("{}-{}", env::consts::OS, env::consts::ARCH)
}
