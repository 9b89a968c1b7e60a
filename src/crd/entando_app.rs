use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{DbmsVendor, EnvironmentVariable, KeycloakToUse};
use super::status::EntandoCustomResourceStatus;
use super::EntandoCustomResource;

/// Application server flavour of the entando-de-app image.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JeeServer {
    #[default]
    Wildfly,
    Eap,
}

impl JeeServer {
    pub fn image_repository(&self) -> &'static str {
        match self {
            JeeServer::Wildfly => "entando/entando-de-app-wildfly",
            JeeServer::Eap => "entando/entando-de-app-eap",
        }
    }
}

/// EntandoApp deploys the Entando application server, the App Builder UI and
/// the component manager behind one Ingress.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoApp",
    shortname = "app",
    namespaced,
    status = "EntandoCustomResourceStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.ingressHostName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoAppSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbms: Option<DbmsVendor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_server_image: Option<JeeServer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_server_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_path: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keycloak_to_use: Option<KeycloakToUse>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_variables: Vec<EnvironmentVariable>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_to_use: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl EntandoCustomResource for EntandoApp {
    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}
