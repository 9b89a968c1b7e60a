//! In-memory substitutes for the cluster and Keycloak facades.
//!
//! `FakeK8sClient` stores every object it is handed and records each call,
//! so tests can assert on the order in which the pipeline touched the
//! cluster. Jobs and pods progress according to the knobs on `FakeState`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentStatus},
    batch::v1::{Job, JobStatus},
    core::v1::{
        ConfigMap, PersistentVolumeClaim, Pod, PodCondition, PodStatus, Secret, Service,
        ServiceAccount,
    },
    networking::v1::Ingress,
    rbac::v1::{Role, RoleBinding},
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use entando_k8s_operator::config::OperatorConfig;
use entando_k8s_operator::controller::Operator;
use entando_k8s_operator::crd::entando_database_service::EntandoDatabaseService;
use entando_k8s_operator::crd::entando_keycloak_server::EntandoKeycloakServer;
use entando_k8s_operator::crd::status::{
    EntandoCustomResourceStatus, EntandoDeploymentPhase, ServerStatus,
};
use entando_k8s_operator::crd::ResourceReference;
use entando_k8s_operator::deploy::wait::pod_is_ready;
use entando_k8s_operator::error::{Error, Result};
use entando_k8s_operator::keycloak::{
    KeycloakClient, KeycloakClientConfig, KeycloakConnector, Permission,
};

pub const NS: &str = "my-namespace";

/// Config with short waits so timeouts are reached quickly.
pub fn fast_config() -> OperatorConfig {
    OperatorConfig {
        operator_namespace: "entando-operator".to_string(),
        pod_completion_timeout: Duration::from_millis(200),
        pod_readiness_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        default_routing_suffix: Some("apps.example.com".to_string()),
        ..Default::default()
    }
}

pub fn meta(name: &str, ns: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        uid: Some(format!("{name}-uid")),
        generation: Some(1),
        ..Default::default()
    }
}

/// A Secret as the API server returns it, with base64-decoded `data`.
pub fn credentials(name: &str, ns: &str, username: &str, password: &str) -> Secret {
    Secret {
        metadata: meta(name, ns),
        data: Some(BTreeMap::from([
            ("username".to_string(), ByteString(username.as_bytes().to_vec())),
            ("password".to_string(), ByteString(password.as_bytes().to_vec())),
        ])),
        ..Default::default()
    }
}

// ── Cluster ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeed,
    Fail,
    Hang,
}

type Key = (String, String);

fn key_of<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

pub struct FakeState {
    pub calls: Vec<String>,
    pub secrets: BTreeMap<Key, Secret>,
    pub config_maps: BTreeMap<Key, ConfigMap>,
    pub pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pub service_accounts: BTreeMap<Key, ServiceAccount>,
    pub roles: BTreeMap<Key, Role>,
    pub role_bindings: BTreeMap<Key, RoleBinding>,
    pub services: BTreeMap<Key, Service>,
    pub ingresses: BTreeMap<Key, Ingress>,
    pub deployments: BTreeMap<Key, Deployment>,
    pub jobs: BTreeMap<Key, Job>,
    pub statuses: BTreeMap<Key, EntandoCustomResourceStatus>,
    pub database_services: Vec<EntandoDatabaseService>,
    pub keycloak_servers: Vec<EntandoKeycloakServer>,
    pub job_outcome: JobOutcome,
    pub pods_ready: bool,
    /// Pods left over from an earlier template, listed next to the current one.
    pub stale_pods: Vec<Pod>,
    pub fail_status_writes: bool,
    job_counter: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            secrets: BTreeMap::new(),
            config_maps: BTreeMap::new(),
            pvcs: BTreeMap::new(),
            service_accounts: BTreeMap::new(),
            roles: BTreeMap::new(),
            role_bindings: BTreeMap::new(),
            services: BTreeMap::new(),
            ingresses: BTreeMap::new(),
            deployments: BTreeMap::new(),
            jobs: BTreeMap::new(),
            statuses: BTreeMap::new(),
            database_services: Vec::new(),
            keycloak_servers: Vec::new(),
            job_outcome: JobOutcome::Succeed,
            pods_ready: true,
            stale_pods: Vec::new(),
            fail_status_writes: false,
            job_counter: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeK8sClient {
    pub state: Mutex<FakeState>,
}

impl FakeK8sClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Index of the first call starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    pub fn status_of(&self, ns: &str, name: &str) -> EntandoCustomResourceStatus {
        self.with(|s| s.statuses.get(&key(ns, name)).cloned().unwrap_or_default())
    }

    fn record(&self, call: String) {
        self.with(|s| s.calls.push(call));
    }
}

pub fn ready_pod(name: &str, ns: &str) -> Pod {
    Pod {
        metadata: meta(name, ns),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pending_pod(name: &str, ns: &str) -> Pod {
    Pod {
        metadata: meta(name, ns),
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Turn `stringData` into `data` the way the API server does.
fn persisted(secret: &Secret) -> Secret {
    let mut stored = secret.clone();
    if let Some(string_data) = stored.string_data.take() {
        let data = stored.data.get_or_insert_with(BTreeMap::new);
        for (k, v) in string_data {
            data.insert(k, ByteString(v.into_bytes()));
        }
    }
    stored
}

#[async_trait]
impl entando_k8s_operator::k8s::K8sClient for FakeK8sClient {
    async fn load_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.with(|s| s.secrets.get(&key(ns, name)).cloned()))
    }

    async fn create_secret_if_absent(&self, secret: &Secret) -> Result<Secret> {
        self.record(format!("create_secret:{}", secret.name_any()));
        Ok(self.with(|s| {
            s.secrets
                .entry(key_of(secret))
                .or_insert_with(|| persisted(secret))
                .clone()
        }))
    }

    async fn load_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.with(|s| s.config_maps.get(&key(ns, name)).cloned()))
    }

    async fn apply_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.record(format!("apply_pvc:{}", pvc.name_any()));
        Ok(self.with(|s| s.pvcs.entry(key_of(pvc)).or_insert_with(|| pvc.clone()).clone()))
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount> {
        self.record(format!("apply_service_account:{}", sa.name_any()));
        self.with(|s| s.service_accounts.insert(key_of(sa), sa.clone()));
        Ok(sa.clone())
    }

    async fn apply_role(&self, role: &Role) -> Result<Role> {
        self.record(format!("apply_role:{}", role.name_any()));
        self.with(|s| s.roles.insert(key_of(role), role.clone()));
        Ok(role.clone())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding> {
        self.record(format!("apply_role_binding:{}", binding.name_any()));
        self.with(|s| s.role_bindings.insert(key_of(binding), binding.clone()));
        Ok(binding.clone())
    }

    async fn apply_service(&self, svc: &Service) -> Result<Service> {
        self.record(format!("apply_service:{}", svc.name_any()));
        self.with(|s| s.services.insert(key_of(svc), svc.clone()));
        Ok(svc.clone())
    }

    async fn load_ingress(&self, ns: &str, name: &str) -> Result<Option<Ingress>> {
        Ok(self.with(|s| s.ingresses.get(&key(ns, name)).cloned()))
    }

    async fn apply_ingress(&self, ingress: &Ingress) -> Result<Ingress> {
        self.record(format!("apply_ingress:{}", ingress.name_any()));
        self.with(|s| s.ingresses.insert(key_of(ingress), ingress.clone()));
        Ok(ingress.clone())
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.record(format!("apply_deployment:{}", deployment.name_any()));
        let stored = self.with(|s| {
            let generation = s
                .deployments
                .get(&key_of(deployment))
                .and_then(|d| d.metadata.generation)
                .unwrap_or(0)
                + 1;
            let mut stored = deployment.clone();
            stored.metadata.generation = Some(generation);
            s.deployments.insert(key_of(deployment), stored.clone());
            stored
        });
        Ok(stored)
    }

    /// Rolled out when pods become ready. Otherwise the stale pods still
    /// count as available and the new replicas as unavailable.
    async fn load_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.with(|s| {
            let ready = s.pods_ready;
            let stale = s.stale_pods.iter().filter(|p| pod_is_ready(p)).count() as i32;
            s.deployments.get(&key(ns, name)).cloned().map(|mut d| {
                let replicas = d.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
                d.status = Some(DeploymentStatus {
                    observed_generation: d.metadata.generation,
                    replicas: Some(if ready { replicas } else { replicas + stale }),
                    updated_replicas: Some(replicas),
                    available_replicas: Some(if ready { replicas } else { stale }),
                    ..Default::default()
                });
                d
            })
        }))
    }

    async fn list_pods(&self, ns: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        let name = format!("{value}-pod");
        Ok(self.with(|s| {
            let mut pods: Vec<Pod> = s
                .stale_pods
                .iter()
                .filter(|p| {
                    p.namespace().as_deref() == Some(ns)
                        && p.labels().get(label).map(String::as_str) == Some(value)
                })
                .cloned()
                .collect();
            pods.push(if s.pods_ready {
                ready_pod(&name, ns)
            } else {
                pending_pod(&name, ns)
            });
            pods
        }))
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let mut created = job.clone();
        let name = self.with(|s| {
            s.job_counter += 1;
            format!(
                "{}{}",
                job.metadata.generate_name.clone().unwrap_or_default(),
                s.job_counter
            )
        });
        created.metadata.name = Some(name.clone());
        self.record(format!("create_job:{name}"));
        self.with(|s| s.jobs.insert(key_of(&created), created.clone()));
        Ok(created)
    }

    async fn load_job(&self, ns: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.with(|s| {
            let outcome = s.job_outcome;
            s.jobs.get(&key(ns, name)).cloned().map(|mut job| {
                job.status = Some(match outcome {
                    JobOutcome::Succeed => JobStatus {
                        succeeded: Some(1),
                        ..Default::default()
                    },
                    JobOutcome::Fail => JobStatus {
                        failed: Some(1),
                        ..Default::default()
                    },
                    JobOutcome::Hang => JobStatus {
                        active: Some(1),
                        ..Default::default()
                    },
                });
                job
            })
        }))
    }

    async fn delete_jobs(&self, ns: &str, label_selector: &str) -> Result<()> {
        self.record(format!("delete_jobs:{label_selector}"));
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        self.with(|s| {
            s.jobs.retain(|(job_ns, _), job| {
                job_ns != ns || job.labels().get(label).map(String::as_str) != Some(value)
            })
        });
        Ok(())
    }

    async fn list_database_services(&self, ns: &str) -> Result<Vec<EntandoDatabaseService>> {
        Ok(self.with(|s| {
            s.database_services
                .iter()
                .filter(|d| d.namespace().as_deref() == Some(ns))
                .cloned()
                .collect()
        }))
    }

    async fn load_keycloak_server(&self, ns: &str, name: &str) -> Result<Option<EntandoKeycloakServer>> {
        Ok(self.with(|s| {
            s.keycloak_servers
                .iter()
                .find(|k| k.namespace().as_deref() == Some(ns) && k.name_any() == name)
                .cloned()
        }))
    }

    async fn list_keycloak_servers(&self) -> Result<Vec<EntandoKeycloakServer>> {
        Ok(self.with(|s| s.keycloak_servers.clone()))
    }

    async fn load_status(&self, target: &ResourceReference) -> Result<EntandoCustomResourceStatus> {
        Ok(self.status_of(&target.namespace, &target.name))
    }

    async fn update_server_status(&self, target: &ResourceReference, status: &ServerStatus) -> Result<()> {
        self.record(format!("update_server_status:{}", status.qualifier));
        if self.with(|s| s.fail_status_writes) {
            return Err(Error::illegal_state("status subresource unavailable"));
        }
        self.with(|s| {
            s.statuses
                .entry(key(&target.namespace, &target.name))
                .or_default()
                .put_server_status(status.clone())
        });
        Ok(())
    }

    async fn update_phase(
        &self,
        target: &ResourceReference,
        phase: EntandoDeploymentPhase,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        self.record(format!("update_phase:{phase}"));
        self.with(|s| {
            let status = s
                .statuses
                .entry(key(&target.namespace, &target.name))
                .or_default();
            status.phase = Some(phase);
            if observed_generation.is_some() {
                status.observed_generation = observed_generation;
            }
        });
        Ok(())
    }
}

// ── Keycloak ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeKeycloakClient {
    pub calls: Mutex<Vec<String>>,
    pub fail_role_assignment: Mutex<bool>,
}

impl FakeKeycloakClient {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl KeycloakClient for FakeKeycloakClient {
    async fn ensure_realm(&self, realm: &str) -> Result<()> {
        self.record(format!("ensure_realm:{realm}"));
        Ok(())
    }

    async fn create_public_client(&self, realm: &str, client_id: &str, _domain: &str) -> Result<()> {
        self.record(format!("create_public_client:{realm}/{client_id}"));
        Ok(())
    }

    async fn prepare_client_and_return_secret(&self, config: &KeycloakClientConfig) -> Result<String> {
        self.record(format!("prepare_client:{}/{}", config.realm, config.client_id));
        Ok(format!("{}-generated-secret", config.client_id))
    }

    async fn update_client(&self, config: &KeycloakClientConfig) -> Result<()> {
        self.record(format!("update_client:{}/{}", config.realm, config.client_id));
        Ok(())
    }

    async fn assign_role_to_client_service_account(
        &self,
        realm: &str,
        client_id: &str,
        permission: &Permission,
    ) -> Result<()> {
        if *self.fail_role_assignment.lock().unwrap() {
            return Err(Error::keycloak("role assignment rejected"));
        }
        self.record(format!(
            "assign_role:{realm}/{client_id}:{}/{}",
            permission.client_id, permission.role
        ));
        Ok(())
    }
}

/// Hands out the same [`FakeKeycloakClient`] and remembers the logins.
#[derive(Default)]
pub struct FakeKeycloakConnector {
    pub client: Arc<FakeKeycloakClient>,
    pub logins: Mutex<Vec<String>>,
}

#[async_trait]
impl KeycloakConnector for FakeKeycloakConnector {
    async fn login(&self, base_url: &str, username: &str, _password: &str) -> Result<Arc<dyn KeycloakClient>> {
        self.logins
            .lock()
            .unwrap()
            .push(format!("{username}@{base_url}"));
        Ok(self.client.clone())
    }
}

pub struct Fakes {
    pub k8s: Arc<FakeK8sClient>,
    pub keycloak: Arc<FakeKeycloakConnector>,
    pub operator: Operator,
}

pub fn fakes(config: OperatorConfig) -> Fakes {
    let k8s = FakeK8sClient::new();
    let keycloak = Arc::new(FakeKeycloakConnector::default());
    let operator = Operator {
        k8s: k8s.clone(),
        keycloak: keycloak.clone(),
        config: Arc::new(config),
    };
    Fakes {
        k8s,
        keycloak,
        operator,
    }
}
