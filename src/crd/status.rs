//! Status model shared by every Entando custom resource.
//!
//! A resource carries one [`ServerStatus`] per qualifier ("server", "db",
//! "cm", ...) plus an overall deployment phase.  The legacy
//! `entandoDeploymentPhase` field is only a wire shim: it is written with the
//! value of `phase` and read when `phase` is absent.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Overall deployment phase of a custom resource.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntandoDeploymentPhase {
    Requested,
    Started,
    Successful,
    Failed,
}

impl fmt::Display for EntandoDeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Started => "started",
            Self::Successful => "successful",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Immutable record of the object that could not be reconciled.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntandoControllerFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_object_api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_object_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_object_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_object_name: Option<String>,
    pub message: String,
    pub detail_message: String,
}

impl EntandoControllerFailure {
    /// Build a failure record from an error. The failed object is the
    /// innermost resource named along the error chain, or `fallback` (usually
    /// the custom resource itself) when the chain names none.
    pub fn from_error(error: &Error, fallback: &crate::crd::ResourceReference) -> Self {
        match error.failed_object() {
            Some(obj) => Self {
                failed_object_api_version: None,
                failed_object_kind: Some(obj.kind),
                failed_object_namespace: Some(obj.namespace),
                failed_object_name: Some(obj.name),
                message: error.to_string(),
                detail_message: error.detail(),
            },
            None => Self {
                failed_object_api_version: Some(fallback.api_version.clone()),
                failed_object_kind: Some(fallback.kind.clone()),
                failed_object_namespace: Some(fallback.namespace.clone()),
                failed_object_name: Some(fallback.name.clone()),
                message: error.to_string(),
                detail_message: error.detail(),
            },
        }
    }
}

/// Whether a qualifier's workload is exposed over HTTP or is a backing service.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ServerStatusType {
    #[default]
    WebServerStatus,
    DbServerStatus,
}

/// Status of one qualifier's sub-deployment.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub qualifier: String,
    #[serde(default, rename = "type")]
    pub type_: ServerStatusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_phases: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployment_phases: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_phases: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub persistent_volume_claim_phases: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derived_deployment_parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub web_contexts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_realm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entando_controller_failure: Option<EntandoControllerFailure>,
}

impl ServerStatus {
    pub fn new(qualifier: impl Into<String>, type_: ServerStatusType) -> Self {
        Self {
            qualifier: qualifier.into(),
            type_,
            ..Default::default()
        }
    }

    /// A status that starts now.
    pub fn started_now(qualifier: impl Into<String>, type_: ServerStatusType) -> Self {
        Self {
            started: Some(Utc::now()),
            ..Self::new(qualifier, type_)
        }
    }

    pub fn has_failed(&self) -> bool {
        self.entando_controller_failure.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Stamp the finish time. Later calls keep the first timestamp.
    pub fn finish(&mut self) {
        if self.finished.is_none() {
            self.finished = Some(Utc::now());
        }
    }

    /// Record a failure and finish. The first failure recorded is kept, so
    /// the status always names the first object that could not be reconciled.
    pub fn finish_with(&mut self, failure: EntandoControllerFailure) {
        if self.entando_controller_failure.is_none() {
            self.entando_controller_failure = Some(failure);
        }
        self.finish();
    }

    pub fn put_derived_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.derived_deployment_parameters
            .insert(key.into(), value.into());
    }
}

/// Status subresource of every Entando custom resource.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "SerializedStatus", into = "SerializedStatus")]
pub struct EntandoCustomResourceStatus {
    pub observed_generation: Option<i64>,
    pub phase: Option<EntandoDeploymentPhase>,
    pub server_statuses: BTreeMap<String, ServerStatus>,
}

impl EntandoCustomResourceStatus {
    /// True iff any contained ServerStatus has failed.
    pub fn has_failed(&self) -> bool {
        self.server_statuses.values().any(ServerStatus::has_failed)
    }

    /// True iff a ServerStatus started at or after `since` has failed. Failures
    /// left behind by earlier passes are ignored.
    pub fn has_failed_since(&self, since: DateTime<Utc>) -> bool {
        self.server_statuses
            .values()
            .any(|s| s.has_failed() && s.started.is_some_and(|t| t >= since))
    }

    /// Most recent finish time across all qualifiers.
    pub fn last_finished(&self) -> Option<DateTime<Utc>> {
        self.server_statuses.values().filter_map(|s| s.finished).max()
    }

    pub fn server_status(&self, qualifier: &str) -> Option<&ServerStatus> {
        self.server_statuses.get(qualifier)
    }

    /// Insert or replace the status for its qualifier.
    pub fn put_server_status(&mut self, status: ServerStatus) {
        self.server_statuses
            .insert(status.qualifier.clone(), status);
    }

    /// Phase implied by the recorded server statuses.
    pub fn calculate_final_phase(&self) -> EntandoDeploymentPhase {
        if self.has_failed() {
            EntandoDeploymentPhase::Failed
        } else {
            EntandoDeploymentPhase::Successful
        }
    }
}

/// Wire form of [`EntandoCustomResourceStatus`] including the legacy phase field.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct SerializedStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phase: Option<EntandoDeploymentPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entando_deployment_phase: Option<EntandoDeploymentPhase>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    server_statuses: BTreeMap<String, ServerStatus>,
}

impl From<SerializedStatus> for EntandoCustomResourceStatus {
    fn from(s: SerializedStatus) -> Self {
        Self {
            observed_generation: s.observed_generation,
            phase: s.phase.or(s.entando_deployment_phase),
            server_statuses: s.server_statuses,
        }
    }
}

impl From<EntandoCustomResourceStatus> for SerializedStatus {
    fn from(s: EntandoCustomResourceStatus) -> Self {
        Self {
            observed_generation: s.observed_generation,
            phase: s.phase,
            entando_deployment_phase: s.phase,
            server_statuses: s.server_statuses,
        }
    }
}

impl JsonSchema for EntandoCustomResourceStatus {
    fn schema_name() -> String {
        "EntandoCustomResourceStatus".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        SerializedStatus::json_schema(gen)
    }
}
