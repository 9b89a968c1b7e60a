use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::{
    apps::v1::Deployment, core::v1::Pod, core::v1::Service, networking::v1::Ingress,
};
use kube::ResourceExt;
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::status::{EntandoControllerFailure, ServerStatus, ServerStatusType};
use crate::error::{Error, Result};
use crate::images::ImageResolver;
use crate::k8s::K8sClient;
use crate::keycloak::KeycloakClient;

use super::child_resources::{self, DeploymentInputs};
use super::database::{DatabaseSchemaCreationResult, SchemaPreparation};
use super::helpers::deployment_selector;
use super::wait::{poll_until, pod_is_ready, pod_phase};
use super::{Deployable, DeploymentResult};

/// Objects produced by a successful pass.
#[derive(Default)]
struct Deployed {
    deployment: Option<Deployment>,
    service: Option<Service>,
    ingress: Option<Ingress>,
    pod: Option<Pod>,
}

/// One reconciliation pass of a [`Deployable`].
///
/// Steps run strictly in order and the qualifier's [`ServerStatus`] is
/// written back to the custom resource after each of them, so a failure
/// part-way leaves an inspectable status behind:
///
/// 1. database schema preparation
/// 2. PersistentVolumeClaims
/// 3. Secrets
/// 4. ServiceAccount and its RBAC
/// 5. Service
/// 6. Ingress
/// 7. Keycloak clients
/// 8. Deployment
/// 9. wait for a Ready pod
pub struct DeployCommand<'a, D: Deployable> {
    deployable: &'a D,
    config: &'a OperatorConfig,
    images: &'a ImageResolver,
    status: ServerStatus,
}

impl<'a, D: Deployable> DeployCommand<'a, D> {
    pub fn new(deployable: &'a D, config: &'a OperatorConfig, images: &'a ImageResolver) -> Self {
        let type_ = if deployable.ingress().is_some() {
            ServerStatusType::WebServerStatus
        } else {
            ServerStatusType::DbServerStatus
        };
        Self {
            deployable,
            config,
            images,
            status: ServerStatus::started_now(deployable.name_qualifier(), type_),
        }
    }

    pub fn status(&self) -> &ServerStatus {
        &self.status
    }

    pub async fn execute(
        mut self,
        k8s: &dyn K8sClient,
        keycloak: Option<&dyn KeycloakClient>,
    ) -> Result<D::Output> {
        let owner = self.deployable.custom_resource().clone();
        if owner.name.is_empty() || owner.namespace.is_empty() {
            return Err(Error::illegal_state(
                "deployables must belong to a persisted custom resource",
            ));
        }
        let needs_keycloak = self
            .deployable
            .containers()
            .iter()
            .any(|c| c.as_keycloak_aware().is_some());
        if needs_keycloak && keycloak.is_none() {
            return Err(Error::illegal_state(format!(
                "{} {} requires a Keycloak client but none was supplied",
                owner.name,
                self.deployable.name_qualifier()
            )));
        }

        match self.run(k8s, keycloak).await {
            Ok(deployed) => {
                self.status.finish();
                self.persist(k8s).await?;
                if self.status.has_failed() {
                    return Err(Error::ResourceCreation(
                        "Creation of Kubernetes resources has failed".to_string(),
                    ));
                }
                info!(name = %owner.name, ns = %owner.namespace, qualifier = %self.status.qualifier, "deployment complete");
                Ok(self
                    .deployable
                    .create_result(deployed.deployment, deployed.service, deployed.ingress, deployed.pod)
                    .with_status(self.status))
            }
            Err(e) => {
                warn!(name = %owner.name, ns = %owner.namespace, qualifier = %self.status.qualifier, error = %e, "deployment failed");
                self.status
                    .finish_with(EntandoControllerFailure::from_error(&e, &owner));
                if let Err(pe) = self.persist(k8s).await {
                    warn!(name = %owner.name, error = %pe, "could not persist failed status");
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, k8s: &dyn K8sClient) -> Result<()> {
        k8s.update_server_status(self.deployable.custom_resource(), &self.status)
            .await
    }

    async fn run(
        &mut self,
        k8s: &dyn K8sClient,
        keycloak: Option<&dyn KeycloakClient>,
    ) -> Result<Deployed> {
        let deployable = self.deployable;
        let owner = deployable.custom_resource();
        let ns = owner.namespace.as_str();
        let qualifier = deployable.name_qualifier();
        let mut deployed = Deployed::default();

        // 1. Database schemas.
        let schemas = self.prepare_database(k8s).await?;

        // 2. PersistentVolumeClaims.
        for pvc in child_resources::persistent_volume_claims(deployable, self.config) {
            let created = k8s.apply_pvc(&pvc).await?;
            let phase = created
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Pending".to_string());
            self.status
                .persistent_volume_claim_phases
                .insert(created.name_any(), phase);
        }
        self.persist(k8s).await?;

        // 3. Secrets.
        let tls_aware = deployable
            .containers()
            .iter()
            .any(|c| c.as_tls_aware().is_some());
        let ca_secret = if tls_aware {
            child_resources::ensure_ca_secret(k8s, self.config, ns).await?
        } else {
            None
        };
        for secret in deployable.secrets() {
            k8s.create_secret_if_absent(&secret).await?;
        }

        // 4. ServiceAccount.
        if let Some(requirements) = deployable.service_account() {
            let (account, rbac) =
                child_resources::service_account_objects(owner, qualifier, &requirements);
            k8s.apply_service_account(&account).await?;
            if let Some((role, binding)) = rbac {
                k8s.apply_role(&role).await?;
                k8s.apply_role_binding(&binding).await?;
            }
        }

        // 5. Service.
        let service = k8s
            .apply_service(&child_resources::service(deployable))
            .await?;
        let service_name = service.name_any();
        self.status
            .service_phases
            .insert(service_name.clone(), "Active".to_string());
        self.status.service_name = Some(service_name);
        deployed.service = Some(service);
        self.persist(k8s).await?;

        // 6. Ingress.
        if let Some(requirements) = deployable.ingress() {
            let existing = k8s.load_ingress(ns, &requirements.ingress_name).await?;
            if let Some(desired) =
                child_resources::ingress(deployable, requirements, existing.as_ref())
            {
                let ingress = k8s.apply_ingress(&desired).await?;
                self.status.ingress_name = Some(requirements.ingress_name.clone());
                self.status.external_base_url = Some(requirements.external_base_url());
                for c in deployable.containers() {
                    if let Some(ing) = c.as_ingressing() {
                        self.status.web_contexts.insert(
                            c.name_qualifier().to_string(),
                            ing.web_context_path().to_string(),
                        );
                    }
                }
                deployed.ingress = Some(ingress);
                self.persist(k8s).await?;
            }
        }

        // 7. Keycloak clients.
        child_resources::register_keycloak_clients(deployable, keycloak, k8s, &mut self.status)
            .await?;

        // 8. Deployment.
        let inputs = DeploymentInputs {
            config: self.config,
            images: self.images,
            schemas: &schemas,
            ca_secret_name: ca_secret.as_deref(),
        };
        let deployment = k8s
            .apply_deployment(&child_resources::deployment(deployable, &inputs))
            .await?;
        let deployment_name = deployment.name_any();
        self.status
            .deployment_phases
            .insert(deployment_name.clone(), "Requested".to_string());
        self.persist(k8s).await?;
        info!(name = %owner.name, %ns, %qualifier, deployment = %deployment_name, "waiting for pod");

        // 9. Ready pod of the current rollout. Pods of a previous template
        // keep the same labels and may still be Ready, so the Deployment must
        // report the new generation fully rolled out first.
        let selector = deployment_selector(owner, qualifier);
        let waited = poll_until(
            self.config.poll_interval,
            self.config.pod_readiness_timeout,
            &format!("waiting for a Ready pod of Deployment {ns}/{deployment_name}"),
            || {
                let selector = selector.clone();
                let deployment_name = deployment_name.clone();
                async move {
                    match k8s.load_deployment(ns, &deployment_name).await? {
                        Some(current) if deployment_rolled_out(&current) => {
                            let pods = k8s.list_pods(ns, &selector).await?;
                            Ok(pods.into_iter().find(pod_is_ready).map(|pod| (current, pod)))
                        }
                        _ => Ok(None),
                    }
                }
            },
        )
        .await;
        if let Ok(pods) = k8s.list_pods(ns, &selector).await {
            self.status.pod_phases.extend(
                pods.iter()
                    .map(|p| (p.name_any(), pod_phase(p))),
            );
        }
        let (deployment, pod) =
            waited.map_err(|e| e.on_resource("Deployment", ns, &deployment_name))?;

        self.status
            .deployment_phases
            .insert(deployment_name, "Available".to_string());
        deployed.deployment = Some(deployment);
        deployed.pod = Some(pod);
        Ok(deployed)
    }

    async fn prepare_database(
        &mut self,
        k8s: &dyn K8sClient,
    ) -> Result<BTreeMap<String, DatabaseSchemaCreationResult>> {
        let deployable = self.deployable;
        let schemas: BTreeSet<String> = deployable
            .containers()
            .iter()
            .filter_map(|c| c.as_db_aware())
            .flat_map(|db| db.database_schema_qualifiers())
            .collect();
        if schemas.is_empty() {
            return Ok(BTreeMap::new());
        }
        let owner = deployable.custom_resource();
        let database = deployable.database().ok_or_else(|| {
            Error::illegal_state(format!(
                "{} {} declares database schemas but no database",
                owner.name,
                deployable.name_qualifier()
            ))
        })?;
        info!(name = %owner.name, ns = %owner.namespace, vendor = %database.vendor, ?schemas, "preparing database schemas");
        let preparation = SchemaPreparation {
            owner,
            qualifier: deployable.name_qualifier(),
            database,
            schemas,
            images: self.images,
            config: self.config,
        };
        let result = preparation.run(k8s, &mut self.status).await;
        // Job phases are kept whatever the outcome.
        if let Err(e) = self.persist(k8s).await {
            if result.is_err() {
                warn!(name = %owner.name, error = %e, "could not persist schema job phases");
            } else {
                return Err(e);
            }
        }
        result.map_err(|e| Error::DatabasePreparation {
            message: "Could not init database schemas".to_string(),
            source: Box::new(e),
        })
    }
}

/// True once the Deployment controller has observed the latest generation
/// and every replica runs the current template and is available.
fn deployment_rolled_out(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let wanted = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let observed = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    };
    let updated = status.updated_replicas.unwrap_or(0);
    observed
        && updated >= wanted
        && status.replicas.unwrap_or(0) <= updated
        && status.available_replicas.unwrap_or(0) >= wanted
}
