use serde::{Deserialize, Serialize};

use crate::RuntimeError;

pub const REQUIRED_CONTRACT_VERSION: &str = "1";

const REQUIRED_ROUTES: &[(&str, &str)] = &[
    ("GET", "/health"),
    ("GET", "/api/contract"),
    ("POST", "/api/chat/stream"),
    ("POST", "/api/sessions"),
    ("GET", "/api/sessions/{session_id}"),
    ("POST", "/api/notebook/execute"),
];

const REQUIRED_SSE_EVENT_TYPES: &[&str] = &["token", "tool_call", "message_end", "error", "done"];

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    pub method: String,
    pub path: String,
}

impl RouteSpec {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }

    fn matches(&self, other: &RouteSpec) -> bool {
        self.method.eq_ignore_ascii_case(&other.method) && self.path == other.path
    }
}

/// Capability document served by the sidecar at `/api/contract`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarContract {
    #[serde(default)]
    pub contract_version: String,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub sse_event_types: Vec<String>,
}

/// What a sidecar must declare before the supervisor trusts it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractRequirements {
    pub contract_version: String,
    pub routes: Vec<RouteSpec>,
    pub sse_event_types: Vec<String>,
}

impl Default for ContractRequirements {
    fn default() -> Self {
        Self {
            contract_version: REQUIRED_CONTRACT_VERSION.to_string(),
            routes: REQUIRED_ROUTES
                .iter()
                .map(|(method, path)| RouteSpec::new(*method, *path))
                .collect(),
            sse_event_types: REQUIRED_SSE_EVENT_TYPES
                .iter()
                .map(|kind| (*kind).to_string())
                .collect(),
        }
    }
}

impl ContractRequirements {
    /// Check a served contract against the required set.
    ///
    /// # Errors
    /// Returns [`RuntimeError::ContractMismatch`] listing every missing item.
    pub fn validate(&self, contract: &SidecarContract) -> Result<(), RuntimeError> {
        let mut problems = Vec::new();
        if contract.contract_version.trim() != self.contract_version {
            problems.push(format!(
                "contract_version `{}` (expected `{}`)",
                contract.contract_version, self.contract_version
            ));
        }
        let missing_routes: Vec<String> = self
            .routes
            .iter()
            .filter(|required| !contract.routes.iter().any(|route| required.matches(route)))
            .map(|route| format!("{} {}", route.method, route.path))
            .collect();
        if !missing_routes.is_empty() {
            problems.push(format!("missing routes: {}", missing_routes.join(", ")));
        }
        let missing_events: Vec<&str> = self
            .sse_event_types
            .iter()
            .filter(|kind| !contract.sse_event_types.contains(kind))
            .map(String::as_str)
            .collect();
        if !missing_events.is_empty() {
            problems.push(format!(
                "missing sse event types: {}",
                missing_events.join(", ")
            ));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::ContractMismatch(problems.join("; ")))
        }
    }

    /// Contract that satisfies these requirements exactly.
    #[must_use]
    pub fn satisfying_contract(&self) -> SidecarContract {
        SidecarContract {
            contract_version: self.contract_version.clone(),
            routes: self.routes.clone(),
            sse_event_types: self.sse_event_types.clone(),
        }
    }
}
