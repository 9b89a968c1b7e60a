//! Resource creators: translate a [`Deployable`] into concrete Kubernetes
//! objects. The builders are pure; the `ensure_*` functions talk to the
//! cluster through the [`K8sClient`] facade.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
    core::v1::{
        Container, ContainerPort, EnvVar, HTTPGetAction, PersistentVolumeClaim,
        PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
        Probe, ResourceRequirements, Secret, SecretVolumeSource, Service, ServiceAccount,
        ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
        VolumeResourceRequirements,
    },
    networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    },
    rbac::v1::{Role, RoleBinding, RoleRef, Subject},
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::crd::status::ServerStatus;
use crate::crd::ResourceReference;
use crate::error::{Error, Result};
use crate::helpers::{
    apply_ratio, keycloak_client_secret_name, standard_name, DEPLOYMENT_SUFFIX, PVC_SUFFIX,
    SERVICE_SUFFIX,
};
use crate::images::ImageResolver;
use crate::k8s::K8sClient;
use crate::keycloak::KeycloakClient;

use super::database::DatabaseSchemaCreationResult;
use super::helpers::{deployment_labels, env, owned_meta, secret_env, DEPLOYMENT_LABEL};
use super::{Deployable, DeployableContainer, IngressRequirements, ServiceAccountRequirements};

const CA_VOLUME: &str = "ca-cert-volume";

pub fn deployment_name<D: Deployable>(deployable: &D) -> String {
    standard_name(
        &deployable.custom_resource().name,
        deployable.name_qualifier(),
        DEPLOYMENT_SUFFIX,
    )
}

pub fn service_name<D: Deployable>(deployable: &D) -> String {
    standard_name(
        &deployable.custom_resource().name,
        deployable.name_qualifier(),
        SERVICE_SUFFIX,
    )
}

pub fn pvc_name(owner: &ResourceReference, container: &dyn DeployableContainer) -> String {
    standard_name(&owner.name, container.name_qualifier(), PVC_SUFFIX)
}

fn port_name(container: &dyn DeployableContainer) -> String {
    format!("{}-port", container.name_qualifier())
}

// ── PersistentVolumeClaims ────────────────────────────────────────────────────

pub fn persistent_volume_claims<D: Deployable>(
    deployable: &D,
    config: &OperatorConfig,
) -> Vec<PersistentVolumeClaim> {
    let owner = deployable.custom_resource();
    deployable
        .containers()
        .iter()
        .filter_map(|c| c.as_persistent_volume_aware().map(|pv| (c, pv)))
        .map(|(c, pv)| {
            let storage_class = pv
                .storage_class()
                .or(deployable.storage_class())
                .or(config.default_storage_class.as_deref())
                .map(str::to_string);
            PersistentVolumeClaim {
                metadata: owned_meta(owner, &pvc_name(owner, c.as_ref()), deployable.name_qualifier()),
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(pv.storage_size().to_string()),
                        )])),
                        ..Default::default()
                    }),
                    storage_class_name: storage_class,
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

// ── Service ───────────────────────────────────────────────────────────────────

pub fn service<D: Deployable>(deployable: &D) -> Service {
    let owner = deployable.custom_resource();
    let qualifier = deployable.name_qualifier();
    let ports = deployable
        .containers()
        .iter()
        .map(|c| ServicePort {
            name: Some(port_name(c.as_ref())),
            port: c.primary_port(),
            target_port: Some(IntOrString::Int(c.primary_port())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: owned_meta(owner, &service_name(deployable), qualifier),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                DEPLOYMENT_LABEL.to_string(),
                crate::helpers::deployment_label(&owner.name, qualifier),
            )])),
            type_: Some("ClusterIP".to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Ingress ───────────────────────────────────────────────────────────────────

/// The shared Ingress with this deployable's paths merged in. Paths owned by
/// other qualifiers are kept; paths with the same value are replaced.
pub fn ingress<D: Deployable>(
    deployable: &D,
    requirements: &IngressRequirements,
    existing: Option<&Ingress>,
) -> Option<Ingress> {
    let owner = deployable.custom_resource();
    let svc = service_name(deployable);
    let ours: Vec<HTTPIngressPath> = deployable
        .containers()
        .iter()
        .filter_map(|c| c.as_ingressing().map(|i| (c, i)))
        .map(|(c, i)| HTTPIngressPath {
            path: Some(i.web_context_path().to_string()),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: svc.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(c.primary_port()),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();
    if ours.is_empty() {
        return None;
    }

    let mut paths: Vec<HTTPIngressPath> = existing
        .and_then(|ing| ing.spec.as_ref())
        .and_then(|spec| spec.rules.as_ref())
        .into_iter()
        .flatten()
        .filter(|rule| rule.host.as_deref() == Some(requirements.host.as_str()))
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter().cloned())
        .filter(|p| !ours.iter().any(|o| o.path == p.path))
        .collect();
    paths.extend(ours);
    paths.sort_by(|a, b| a.path.cmp(&b.path));

    let mut metadata = owned_meta(owner, &requirements.ingress_name, deployable.name_qualifier());
    // The Ingress is shared by every qualifier of the resource.
    if let Some(labels) = metadata.labels.as_mut() {
        labels.remove(DEPLOYMENT_LABEL);
    }
    Some(Ingress {
        metadata,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(requirements.host.clone()),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            tls: requirements.tls_secret_name.as_ref().map(|secret| {
                vec![IngressTLS {
                    hosts: Some(vec![requirements.host.clone()]),
                    secret_name: Some(secret.clone()),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// ── ServiceAccount ────────────────────────────────────────────────────────────

/// ServiceAccount plus the Role and RoleBinding granting it its rules. The
/// account may be shared by several resources, so it carries no owner.
pub fn service_account_objects(
    owner: &ResourceReference,
    qualifier: &str,
    requirements: &ServiceAccountRequirements,
) -> (ServiceAccount, Option<(Role, RoleBinding)>) {
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(requirements.name.clone()),
            namespace: Some(owner.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    if requirements.rules.is_empty() {
        return (account, None);
    }
    let role_name = standard_name(&owner.name, qualifier, "role");
    let role = Role {
        metadata: owned_meta(owner, &role_name, qualifier),
        rules: Some(requirements.rules.clone()),
    };
    let binding = RoleBinding {
        metadata: owned_meta(owner, &standard_name(&owner.name, qualifier, "rolebinding"), qualifier),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: requirements.name.clone(),
            namespace: Some(owner.namespace.clone()),
            ..Default::default()
        }]),
    };
    (account, Some((role, binding)))
}

// ── Deployment ────────────────────────────────────────────────────────────────

/// Inputs resolved by earlier pipeline steps.
pub struct DeploymentInputs<'a> {
    pub config: &'a OperatorConfig,
    pub images: &'a ImageResolver,
    pub schemas: &'a BTreeMap<String, DatabaseSchemaCreationResult>,
    /// CA secret mirrored into the namespace, if any.
    pub ca_secret_name: Option<&'a str>,
}

/// Variables pointing a Keycloak-aware container at its server and client.
pub fn keycloak_variables(container: &dyn DeployableContainer) -> Vec<EnvVar> {
    let Some(aware) = container.as_keycloak_aware() else {
        return Vec::new();
    };
    let conn = aware.keycloak_connection();
    let client_id = aware.keycloak_client_config().client_id;
    let secret = keycloak_client_secret_name(&client_id);
    vec![
        env("KEYCLOAK_ENABLED", "true"),
        env("KEYCLOAK_AUTH_URL", conn.base_url.clone()),
        env("KEYCLOAK_REALM", conn.realm.clone()),
        env("KEYCLOAK_PUBLIC_CLIENT_ID", conn.public_client_id.clone()),
        secret_env("KEYCLOAK_CLIENT_ID", &secret, "clientId"),
        secret_env("KEYCLOAK_CLIENT_SECRET", &secret, "clientSecret"),
    ]
}

/// Limits from the container, requests derived with the configured ratios.
pub fn resource_requirements(
    container: &dyn DeployableContainer,
    config: &OperatorConfig,
) -> Option<ResourceRequirements> {
    if !config.impose_limits {
        return None;
    }
    let memory = format!("{}Mi", container.memory_limit_mebibytes());
    let cpu = format!("{}m", container.cpu_limit_millicores());
    let mut requests = BTreeMap::new();
    if let Some(v) = apply_ratio(&memory, config.request_to_limit_ratios.memory) {
        requests.insert("memory".to_string(), Quantity(v));
    }
    if let Some(v) = apply_ratio(&cpu, config.request_to_limit_ratios.cpu) {
        requests.insert("cpu".to_string(), Quantity(v));
    }
    Some(ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("memory".to_string(), Quantity(memory)),
            ("cpu".to_string(), Quantity(cpu)),
        ])),
        requests: Some(requests),
        ..Default::default()
    })
}

fn probes(container: &dyn DeployableContainer, config: &OperatorConfig) -> (Probe, Probe, Probe) {
    let port = IntOrString::Int(container.primary_port());
    let base = match container.as_ingressing() {
        Some(ing) => Probe {
            http_get: Some(HTTPGetAction {
                path: Some(ing.health_check_path()),
                port,
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Probe {
            tcp_socket: Some(TCPSocketAction {
                port,
                ..Default::default()
            }),
            ..Default::default()
        },
    };
    let period = 10;
    let startup_threshold = (config.pod_readiness_timeout.as_secs() as i32 / period).max(1);
    let startup = Probe {
        period_seconds: Some(period),
        failure_threshold: Some(startup_threshold),
        ..base.clone()
    };
    let readiness = Probe {
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        ..base.clone()
    };
    let liveness = Probe {
        period_seconds: Some(30),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..base
    };
    (startup, readiness, liveness)
}

pub fn container_spec(
    owner: &ResourceReference,
    container: &dyn DeployableContainer,
    inputs: &DeploymentInputs<'_>,
) -> Container {
    let qualifier = container.name_qualifier();
    let image = match container.custom_image() {
        Some(image) => image.to_string(),
        None => inputs
            .images
            .determine_image_uri(container.image_repository(), None),
    };

    let mut env_vars = container.environment_variables();
    if let Some(db) = container.as_db_aware() {
        env_vars.extend(db.database_connection_variables(inputs.schemas));
    }
    env_vars.extend(keycloak_variables(container));

    let mut mounts = Vec::new();
    if let Some(pv) = container.as_persistent_volume_aware() {
        mounts.push(VolumeMount {
            name: format!("{qualifier}-volume"),
            mount_path: pv.volume_mount_path().to_string(),
            ..Default::default()
        });
    }
    if let (Some(tls), Some(_)) = (container.as_tls_aware(), inputs.ca_secret_name) {
        mounts.push(VolumeMount {
            name: CA_VOLUME.to_string(),
            mount_path: tls.ca_cert_mount_path().to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    debug!(name = %owner.name, %qualifier, %image, "building container");

    let (startup, readiness, liveness) = probes(container, inputs.config);
    Container {
        name: format!("{qualifier}-container"),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(port_name(container)),
            container_port: container.primary_port(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env_vars),
        resources: resource_requirements(container, inputs.config),
        startup_probe: Some(startup),
        readiness_probe: Some(readiness),
        liveness_probe: Some(liveness),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Default::default()
    }
}

pub fn deployment<D: Deployable>(deployable: &D, inputs: &DeploymentInputs<'_>) -> Deployment {
    let owner = deployable.custom_resource();
    let qualifier = deployable.name_qualifier();
    let labels = deployment_labels(owner, qualifier);

    let mut volumes = Vec::new();
    for c in deployable.containers() {
        if c.as_persistent_volume_aware().is_some() {
            volumes.push(Volume {
                name: format!("{}-volume", c.name_qualifier()),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(owner, c.as_ref()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }
    let has_claims = !volumes.is_empty();
    let tls_aware = deployable
        .containers()
        .iter()
        .any(|c| c.as_tls_aware().is_some());
    if let (true, Some(ca)) = (tls_aware, inputs.ca_secret_name) {
        volumes.push(Volume {
            name: CA_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(ca.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let containers = deployable
        .containers()
        .iter()
        .map(|c| container_spec(owner, c.as_ref(), inputs))
        .collect();

    Deployment {
        metadata: owned_meta(owner, &deployment_name(deployable), qualifier),
        spec: Some(DeploymentSpec {
            replicas: Some(deployable.replicas()),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    DEPLOYMENT_LABEL.to_string(),
                    crate::helpers::deployment_label(&owner.name, qualifier),
                )])),
                ..Default::default()
            },
            // ReadWriteOnce claims cannot be mounted by two pods during a rollout.
            strategy: Some(DeploymentStrategy {
                type_: Some(if has_claims { "Recreate" } else { "RollingUpdate" }.to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: deployable.service_account().map(|sa| sa.name),
                    volumes: if volumes.is_empty() { None } else { Some(volumes) },
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Cluster-facing creators ───────────────────────────────────────────────────

/// Copy the CA bundle Secret from the operator namespace into `ns` so TLS-aware
/// containers can mount it. Returns the Secret name, or `None` when no CA
/// secret is configured.
pub async fn ensure_ca_secret(
    k8s: &dyn K8sClient,
    config: &OperatorConfig,
    ns: &str,
) -> Result<Option<String>> {
    let Some(secret_name) = config.ca_secret_name.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if k8s.load_secret(ns, secret_name).await?.is_some() {
        return Ok(Some(secret_name.to_string()));
    }
    let source = k8s
        .load_secret(&config.operator_namespace, secret_name)
        .await?
        .ok_or_else(|| {
            Error::config(format!(
                "CA secret {}/{secret_name} does not exist",
                config.operator_namespace
            ))
        })?;
    let mirrored = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(ns.to_string()),
            // Shared by every resource in the namespace, so no owner.
            ..Default::default()
        },
        data: source.data,
        type_: source.type_,
        ..Default::default()
    };
    k8s.create_secret_if_absent(&mirrored).await?;
    Ok(Some(secret_name.to_string()))
}

/// Register the Keycloak clients of every Keycloak-aware container and store
/// their secrets. `keycloak` must be present when any container needs it.
pub async fn register_keycloak_clients<D: Deployable>(
    deployable: &D,
    keycloak: Option<&dyn KeycloakClient>,
    k8s: &dyn K8sClient,
    status: &mut ServerStatus,
) -> Result<()> {
    let owner = deployable.custom_resource();
    for container in deployable.containers() {
        let Some(aware) = container.as_keycloak_aware() else {
            continue;
        };
        let keycloak = keycloak.ok_or_else(|| {
            Error::illegal_state(format!(
                "container {} of {} needs a Keycloak client but none was supplied",
                container.name_qualifier(),
                owner.name
            ))
        })?;
        let conn = aware.keycloak_connection();
        let config = aware.keycloak_client_config();
        let fail = |e: Error| e.on_resource("KeycloakClient", &owner.namespace, &config.client_id);

        keycloak.ensure_realm(&conn.realm).await.map_err(fail)?;
        if let Some(ingress) = deployable.ingress() {
            keycloak
                .create_public_client(&conn.realm, &conn.public_client_id, &ingress.external_base_url())
                .await
                .map_err(fail)?;
        }
        let client_secret = keycloak
            .prepare_client_and_return_secret(&config)
            .await
            .map_err(fail)?;
        info!(name = %owner.name, client_id = %config.client_id, "keycloak client registered");

        let secret = Secret {
            metadata: owned_meta(
                owner,
                &keycloak_client_secret_name(&config.client_id),
                deployable.name_qualifier(),
            ),
            type_: Some("Opaque".to_string()),
            string_data: Some(BTreeMap::from([
                ("clientId".to_string(), config.client_id.clone()),
                ("clientSecret".to_string(), client_secret),
            ])),
            ..Default::default()
        };
        k8s.create_secret_if_absent(&secret).await?;
        status.sso_realm = Some(conn.realm.clone());
        status.sso_client_id = Some(config.client_id.clone());
    }
    Ok(())
}
