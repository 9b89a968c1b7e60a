use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{DbmsVendor, EnvironmentVariable};
use super::status::EntandoCustomResourceStatus;
use super::EntandoCustomResource;

/// Which SSO distribution to run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StandardKeycloakImage {
    #[default]
    Keycloak,
    RedhatSso,
}

impl StandardKeycloakImage {
    pub fn image_repository(&self) -> &'static str {
        match self {
            StandardKeycloakImage::Keycloak => "entando/entando-keycloak",
            StandardKeycloakImage::RedhatSso => "entando/entando-redhat-sso",
        }
    }
}

/// EntandoKeycloakServer deploys the SSO server applications authenticate against.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoKeycloakServer",
    shortname = "kc",
    namespaced,
    status = "EntandoCustomResourceStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.ingressHostName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoKeycloakServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbms: Option<DbmsVendor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_image: Option<StandardKeycloakImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_end_url: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Used by applications that do not name a Keycloak server explicitly.
    #[serde(default)]
    pub default: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_variables: Vec<EnvironmentVariable>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl EntandoCustomResource for EntandoKeycloakServer {
    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}
