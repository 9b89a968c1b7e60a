use std::fmt;

use k8s_openapi::api::core::v1::EnvVar;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DBMS vendor requested by a custom resource.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DbmsVendor {
    Mysql,
    Postgresql,
    Oracle,
    Embedded,
    None,
}

impl DbmsVendor {
    /// True when the vendor runs as a separate database server.
    pub fn is_external_server(&self) -> bool {
        matches!(
            self,
            DbmsVendor::Mysql | DbmsVendor::Postgresql | DbmsVendor::Oracle
        )
    }
}

impl fmt::Display for DbmsVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::Oracle => "oracle",
            Self::Embedded => "embedded",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Reference to the EntandoKeycloakServer an application authenticates against.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakToUse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_client_id: Option<String>,
}

/// A plain name/value environment variable declared in a custom resource spec.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl From<&EnvironmentVariable> for EnvVar {
    fn from(v: &EnvironmentVariable) -> Self {
        EnvVar {
            name: v.name.clone(),
            value: Some(v.value.clone()),
            ..Default::default()
        }
    }
}
