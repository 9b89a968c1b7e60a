use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{DbmsVendor, EnvironmentVariable};
use super::status::EntandoCustomResourceStatus;
use super::EntandoCustomResource;

/// EntandoDatabaseService either deploys a database server in-cluster or
/// describes an external one that other resources can prepare schemas on.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoDatabaseService",
    shortname = "edbs",
    namespaced,
    status = "EntandoCustomResourceStatus",
    printcolumn = r#"{"name": "Vendor", "type": "string", "jsonPath": ".spec.dbms"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoDatabaseServiceSpec {
    pub dbms: DbmsVendor,

    /// Hostname of an external database. Required unless `createDeployment` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,

    /// Secret with the admin `username` and `password` of an external database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default)]
    pub create_deployment: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tablespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jdbc_parameters: Option<std::collections::BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_variables: Vec<EnvironmentVariable>,
}

impl EntandoCustomResource for EntandoDatabaseService {
    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}
