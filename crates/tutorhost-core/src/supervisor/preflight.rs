use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::{sleep, timeout, Instant};
use tutorhost_domain::{ContractRequirements, PreflightPhase, RuntimeError, SidecarContract};

/// Single-shot checks against a running sidecar.
#[async_trait]
pub trait SidecarProbe: Send + Sync {
    /// One liveness request; `Ok` means a 2xx status with a JSON body.
    async fn health(&self, base_url: &str) -> Result<(), RuntimeError>;

    /// Fetch the capability document.
    async fn contract(&self, base_url: &str) -> Result<SidecarContract, RuntimeError>;
}

/// [`SidecarProbe`] over localhost HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SidecarProbe for HttpProbe {
    async fn health(&self, base_url: &str) -> Result<(), RuntimeError> {
        let url = format!("{base_url}/health");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| RuntimeError::HealthCheck(format!("{url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::HealthCheck(format!("{url} returned {status}")));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map(|_| ())
            .map_err(|err| RuntimeError::HealthCheck(format!("{url} returned a non-JSON body: {err}")))
    }

    async fn contract(&self, base_url: &str) -> Result<SidecarContract, RuntimeError> {
        let url = format!("{base_url}/api/contract");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| RuntimeError::ContractMismatch(format!("{url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::ContractMismatch(format!(
                "{url} returned {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| RuntimeError::ContractMismatch(format!("invalid contract document: {err}")))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PreflightTiming {
    pub(crate) budget: Duration,
    pub(crate) poll_interval: Duration,
}

/// Poll liveness until it passes or the budget runs out, then validate the
/// contract once. `on_phase` is told when each stage begins.
pub(crate) async fn run_preflight(
    probe: &dyn SidecarProbe,
    base_url: &str,
    requirements: &ContractRequirements,
    timing: PreflightTiming,
    on_phase: &(dyn Fn(PreflightPhase) + Send + Sync),
) -> Result<(), (PreflightPhase, RuntimeError)> {
    let deadline = Instant::now() + timing.budget;

    on_phase(PreflightPhase::Health);
    let mut last_error = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let detail = last_error.map_or_else(
                || "no response".to_string(),
                |err: RuntimeError| err.to_string(),
            );
            return Err((
                PreflightPhase::Health,
                RuntimeError::HealthCheck(format!(
                    "sidecar not healthy after {}ms: {detail}",
                    timing.budget.as_millis()
                )),
            ));
        }
        match timeout(remaining, probe.health(base_url)).await {
            Ok(Ok(())) => break,
            Ok(Err(err)) => last_error = Some(err),
            Err(_) => continue,
        }
        sleep(timing.poll_interval.min(deadline.saturating_duration_since(Instant::now()))).await;
    }

    on_phase(PreflightPhase::Contract);
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(timing.poll_interval);
    let contract = timeout(remaining, probe.contract(base_url))
        .await
        .map_err(|_| {
            (
                PreflightPhase::Contract,
                RuntimeError::ContractMismatch("contract request timed out".to_string()),
            )
        })?
        .map_err(|err| (PreflightPhase::Contract, err))?;
    requirements
        .validate(&contract)
        .map_err(|err| (PreflightPhase::Contract, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{cycle, matchers::*, responders::*, Expectation, Server};
    use serde_json::json;
    use std::sync::Mutex;

    fn probe() -> HttpProbe {
        HttpProbe::new(tutorhost_store::http_client(Duration::from_secs(2)).unwrap())
    }

    fn timing(budget_ms: u64) -> PreflightTiming {
        PreflightTiming {
            budget: Duration::from_millis(budget_ms),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn base(server: &Server) -> String {
        server.url("/").to_string().trim_end_matches('/').to_string()
    }

    fn contract_json(requirements: &ContractRequirements) -> serde_json::Value {
        serde_json::to_value(requirements.satisfying_contract()).unwrap()
    }

    #[tokio::test]
    async fn passes_after_health_becomes_ready() {
        let server = Server::run();
        let requirements = ContractRequirements::default();
        server.expect(
            Expectation::matching(request::method_path("GET", "/health"))
                .times(3)
                .respond_with(cycle![
                    status_code(503),
                    status_code(503),
                    json_encoded(json!({ "status": "ok" })),
                ]),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/contract"))
                .respond_with(json_encoded(contract_json(&requirements))),
        );
        let phases = Mutex::new(Vec::new());
        run_preflight(
            &probe(),
            &base(&server),
            &requirements,
            timing(2_000),
            &|phase| phases.lock().unwrap().push(phase),
        )
        .await
        .unwrap();
        assert_eq!(
            *phases.lock().unwrap(),
            vec![PreflightPhase::Health, PreflightPhase::Contract]
        );
    }

    #[tokio::test]
    async fn missing_route_fails_in_contract_phase_despite_healthy() {
        let server = Server::run();
        let requirements = ContractRequirements::default();
        let mut served = requirements.satisfying_contract();
        served.routes.retain(|route| route.path != "/api/notebook/execute");
        server.expect(
            Expectation::matching(request::method_path("GET", "/health"))
                .respond_with(json_encoded(json!({ "status": "ok" }))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/contract"))
                .respond_with(json_encoded(serde_json::to_value(served).unwrap())),
        );
        let (phase, err) = run_preflight(
            &probe(),
            &base(&server),
            &requirements,
            timing(2_000),
            &|_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(phase, PreflightPhase::Contract);
        assert!(matches!(err, RuntimeError::ContractMismatch(_)));
        assert!(err.to_string().contains("/api/notebook/execute"), "{err}");
    }

    #[tokio::test]
    async fn non_json_health_body_is_not_alive() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/health"))
                .times(1..)
                .respond_with(status_code(200).body("OK")),
        );
        let (phase, err) = run_preflight(
            &probe(),
            &base(&server),
            &ContractRequirements::default(),
            timing(200),
            &|_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(phase, PreflightPhase::Health);
        assert!(matches!(err, RuntimeError::HealthCheck(_)));
    }

    #[tokio::test]
    async fn unreachable_sidecar_times_out_as_health_failure() {
        let started = Instant::now();
        let (phase, err) = run_preflight(
            &probe(),
            "http://127.0.0.1:9",
            &ContractRequirements::default(),
            timing(300),
            &|_| {},
        )
        .await
        .unwrap_err();
        assert_eq!(phase, PreflightPhase::Health);
        assert!(err.to_string().contains("not healthy"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
