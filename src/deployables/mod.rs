//! Concrete deployables built from the Entando custom resources.

pub mod app;
pub mod database;
pub mod keycloak;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{EnvVar, Pod, Secret, Service},
    networking::v1::Ingress,
};

use crate::config::OperatorConfig;
use crate::crd::shared::EnvironmentVariable;
use crate::crd::ResourceReference;
use crate::deploy::{
    DatabaseConnectionInfo, Deployable, DeployableContainer, IngressRequirements,
    ServiceAccountRequirements, ServiceDeploymentResult,
};
use crate::error::{Error, Result};
use crate::helpers::ingress_name;

/// A deployable assembled from parts, used for every HTTP-facing qualifier.
pub struct ServiceDeployable {
    pub owner: ResourceReference,
    pub qualifier: String,
    pub replicas: i32,
    pub containers: Vec<Box<dyn DeployableContainer>>,
    pub secrets: Vec<Secret>,
    pub service_account: Option<ServiceAccountRequirements>,
    pub database: Option<DatabaseConnectionInfo>,
    pub ingress: Option<IngressRequirements>,
    pub storage_class: Option<String>,
}

impl ServiceDeployable {
    pub fn new(owner: ResourceReference, qualifier: &str) -> Self {
        Self {
            owner,
            qualifier: qualifier.to_string(),
            replicas: 1,
            containers: Vec::new(),
            secrets: Vec::new(),
            service_account: None,
            database: None,
            ingress: None,
            storage_class: None,
        }
    }
}

impl Deployable for ServiceDeployable {
    type Output = ServiceDeploymentResult;

    fn custom_resource(&self) -> &ResourceReference {
        &self.owner
    }

    fn name_qualifier(&self) -> &str {
        &self.qualifier
    }

    fn replicas(&self) -> i32 {
        self.replicas
    }

    fn containers(&self) -> &[Box<dyn DeployableContainer>] {
        &self.containers
    }

    fn secrets(&self) -> Vec<Secret> {
        self.secrets.clone()
    }

    fn service_account(&self) -> Option<ServiceAccountRequirements> {
        self.service_account.clone()
    }

    fn database(&self) -> Option<&DatabaseConnectionInfo> {
        self.database.as_ref()
    }

    fn ingress(&self) -> Option<&IngressRequirements> {
        self.ingress.as_ref()
    }

    fn storage_class(&self) -> Option<&str> {
        self.storage_class.as_deref()
    }

    fn create_result(
        &self,
        deployment: Option<Deployment>,
        service: Option<Service>,
        ingress: Option<Ingress>,
        pod: Option<Pod>,
    ) -> ServiceDeploymentResult {
        ServiceDeploymentResult::new(deployment, service, ingress, pod)
    }
}

/// The Ingress of a resource: the requested host, or `<name>-<namespace>.<suffix>`
/// under the default routing suffix.
pub fn ingress_requirements(
    owner: &ResourceReference,
    host: Option<&str>,
    tls_secret_name: Option<&str>,
    config: &OperatorConfig,
) -> Result<IngressRequirements> {
    let host = match host.filter(|h| !h.is_empty()) {
        Some(h) => h.to_string(),
        None => {
            let suffix = config.default_routing_suffix.as_deref().ok_or_else(|| {
                Error::config(format!(
                    "{} {}/{} has no ingressHostName and no default routing suffix is configured",
                    owner.kind, owner.namespace, owner.name
                ))
            })?;
            format!("{}-{}.{suffix}", owner.name, owner.namespace)
        }
    };
    Ok(IngressRequirements {
        ingress_name: ingress_name(&owner.name),
        host,
        tls_secret_name: tls_secret_name
            .or(config.default_tls_secret_name.as_deref())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

/// Variables declared on the custom resource itself.
pub fn spec_variables(vars: &[EnvironmentVariable]) -> Vec<EnvVar> {
    vars.iter().map(EnvVar::from).collect()
}

/// Cluster-internal DNS name of a Service.
pub fn internal_hostname(service_name: &str, namespace: &str) -> String {
    format!("{service_name}.{namespace}.svc.cluster.local")
}
