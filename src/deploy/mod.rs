//! Deployment orchestration core.
//!
//! A [`Deployable`] is a side-effect free plan for one qualifier of a custom
//! resource: the containers to run and what each of them needs from the
//! cluster. [`DeployCommand`] turns that plan into Kubernetes objects, one
//! strictly ordered step at a time, persisting a [`ServerStatus`] after each.

pub mod child_resources;
pub mod command;
pub mod database;
pub mod helpers;
pub mod wait;

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{EnvVar, Pod, Secret, Service},
    networking::v1::Ingress,
    rbac::v1::PolicyRule,
};

use crate::crd::status::ServerStatus;
use crate::crd::ResourceReference;
use crate::keycloak::KeycloakClientConfig;

pub use command::DeployCommand;
pub use database::{DatabaseConnectionInfo, DatabaseSchemaCreationResult};

// ── Container capabilities ────────────────────────────────────────────────────

/// One container of a [`Deployable`]. Capabilities are opted into by
/// overriding the matching `as_*` accessor.
pub trait DeployableContainer: Send + Sync {
    /// Short role name, e.g. `server`, `ab`, `cm`.
    fn name_qualifier(&self) -> &str;

    /// Repository the image is resolved from, e.g. `entando/app-builder`.
    fn image_repository(&self) -> &str;

    /// A complete image reference that bypasses resolution.
    fn custom_image(&self) -> Option<&str> {
        None
    }

    fn primary_port(&self) -> i32;

    fn memory_limit_mebibytes(&self) -> i32;

    fn cpu_limit_millicores(&self) -> i32;

    /// Variables that depend only on the container itself.
    fn environment_variables(&self) -> Vec<EnvVar> {
        Vec::new()
    }

    fn as_ingressing(&self) -> Option<&dyn IngressingContainer> {
        None
    }

    fn as_db_aware(&self) -> Option<&dyn DbAware> {
        None
    }

    fn as_tls_aware(&self) -> Option<&dyn TlsAware> {
        None
    }

    fn as_persistent_volume_aware(&self) -> Option<&dyn PersistentVolumeAware> {
        None
    }

    fn as_keycloak_aware(&self) -> Option<&dyn KeycloakAware> {
        None
    }
}

/// A container served over HTTP behind the Ingress.
pub trait IngressingContainer {
    fn web_context_path(&self) -> &str;

    /// Path probed for readiness. Defaults to the web context.
    fn health_check_path(&self) -> String {
        self.web_context_path().to_string()
    }
}

/// A container that needs database schemas prepared before it starts.
pub trait DbAware {
    fn database_schema_qualifiers(&self) -> Vec<String>;

    /// Connection variables for the prepared schemas.
    fn database_connection_variables(
        &self,
        schemas: &BTreeMap<String, DatabaseSchemaCreationResult>,
    ) -> Vec<EnvVar>;
}

/// A container that trusts the operator's CA bundle, when one is configured.
pub trait TlsAware {
    fn ca_cert_mount_path(&self) -> &str {
        "/etc/entando/ca"
    }
}

/// A container that keeps state on a PersistentVolumeClaim.
pub trait PersistentVolumeAware {
    fn volume_mount_path(&self) -> &str;

    fn storage_size(&self) -> &str {
        "2Gi"
    }

    /// Overrides the storage class of the owning resource.
    fn storage_class(&self) -> Option<&str> {
        None
    }
}

/// Where an SSO-protected container finds its Keycloak server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeycloakConnection {
    /// External base URL, including the `/auth` context.
    pub base_url: String,
    pub internal_base_url: String,
    pub realm: String,
    pub public_client_id: String,
}

/// A container that authenticates through a Keycloak client of its own.
pub trait KeycloakAware {
    fn keycloak_connection(&self) -> &KeycloakConnection;

    fn keycloak_client_config(&self) -> KeycloakClientConfig;
}

// ── Deployable ────────────────────────────────────────────────────────────────

/// Ingress the deployable's ingressing containers are exposed on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressRequirements {
    pub ingress_name: String,
    pub host: String,
    pub tls_secret_name: Option<String>,
}

impl IngressRequirements {
    pub fn scheme(&self) -> &'static str {
        if self.tls_secret_name.is_some() {
            "https"
        } else {
            "http"
        }
    }

    pub fn external_base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.host)
    }
}

/// A ServiceAccount the pods run as, with the namespace-scoped rules it needs.
#[derive(Clone, Debug, Default)]
pub struct ServiceAccountRequirements {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

/// One reconciliation unit: a qualifier's worth of containers plus the
/// infrastructure they need.
pub trait Deployable: Send + Sync {
    type Output: DeploymentResult;

    fn custom_resource(&self) -> &ResourceReference;

    fn name_qualifier(&self) -> &str;

    fn replicas(&self) -> i32 {
        1
    }

    fn containers(&self) -> &[Box<dyn DeployableContainer>];

    /// Secrets created once and never regenerated.
    fn secrets(&self) -> Vec<Secret> {
        Vec::new()
    }

    fn service_account(&self) -> Option<ServiceAccountRequirements> {
        None
    }

    /// Database the DbAware containers get their schemas on.
    fn database(&self) -> Option<&DatabaseConnectionInfo> {
        None
    }

    fn ingress(&self) -> Option<&IngressRequirements> {
        None
    }

    /// Storage class for claims, when the resource names one.
    fn storage_class(&self) -> Option<&str> {
        None
    }

    fn create_result(
        &self,
        deployment: Option<Deployment>,
        service: Option<Service>,
        ingress: Option<Ingress>,
        pod: Option<Pod>,
    ) -> Self::Output;
}

/// Outcome of a [`DeployCommand`], carrying the final [`ServerStatus`].
pub trait DeploymentResult {
    fn with_status(self, status: ServerStatus) -> Self;

    fn status(&self) -> &ServerStatus;
}

/// The objects a deployable ended up with.
#[derive(Clone, Debug, Default)]
pub struct ServiceDeploymentResult {
    pub deployment: Option<Deployment>,
    pub service: Option<Service>,
    pub ingress: Option<Ingress>,
    pub pod: Option<Pod>,
    pub status: ServerStatus,
}

impl ServiceDeploymentResult {
    pub fn new(
        deployment: Option<Deployment>,
        service: Option<Service>,
        ingress: Option<Ingress>,
        pod: Option<Pod>,
    ) -> Self {
        Self {
            deployment,
            service,
            ingress,
            pod,
            status: ServerStatus::default(),
        }
    }

    pub fn service_name(&self) -> Option<String> {
        self.service.as_ref().and_then(|s| s.metadata.name.clone())
    }
}

impl DeploymentResult for ServiceDeploymentResult {
    fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = status;
        self
    }

    fn status(&self) -> &ServerStatus {
        &self.status
    }
}
