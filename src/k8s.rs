//! Cluster facade: the only seam between the deployment core and the API server.
//!
//! [`K8sClient`] is object-safe so the core can be driven by the kube-rs
//! backed [`KubeClient`] in production and by an in-memory substitute in tests.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount},
    networking::v1::Ingress,
    rbac::v1::{Role, RoleBinding},
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::crd::entando_database_service::EntandoDatabaseService;
use crate::crd::entando_keycloak_server::EntandoKeycloakServer;
use crate::crd::status::{EntandoCustomResourceStatus, EntandoDeploymentPhase, ServerStatus};
use crate::crd::ResourceReference;
use crate::error::{Error, Result, ResultExt};

/// Field manager name used for server-side apply patches.
pub const FIELD_MANAGER: &str = "entando-k8s-operator";

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

#[async_trait]
pub trait K8sClient: Send + Sync {
    async fn load_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>>;

    /// Create the Secret unless one with the same name exists. An existing
    /// Secret is returned untouched so generated passwords survive.
    async fn create_secret_if_absent(&self, secret: &Secret) -> Result<Secret>;

    async fn load_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create the claim unless it exists. Claims are immutable once bound.
    async fn apply_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount>;

    async fn apply_role(&self, role: &Role) -> Result<Role>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding>;

    async fn apply_service(&self, svc: &Service) -> Result<Service>;

    async fn load_ingress(&self, ns: &str, name: &str) -> Result<Option<Ingress>>;

    async fn apply_ingress(&self, ingress: &Ingress) -> Result<Ingress>;

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn load_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>>;

    async fn list_pods(&self, ns: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn create_job(&self, job: &Job) -> Result<Job>;

    async fn load_job(&self, ns: &str, name: &str) -> Result<Option<Job>>;

    async fn delete_jobs(&self, ns: &str, label_selector: &str) -> Result<()>;

    async fn list_database_services(&self, ns: &str) -> Result<Vec<EntandoDatabaseService>>;

    async fn load_keycloak_server(&self, ns: &str, name: &str) -> Result<Option<EntandoKeycloakServer>>;

    /// Keycloak servers in every namespace.
    async fn list_keycloak_servers(&self) -> Result<Vec<EntandoKeycloakServer>>;

    async fn load_status(&self, target: &ResourceReference) -> Result<EntandoCustomResourceStatus>;

    /// Persist one qualifier's ServerStatus, leaving the other qualifiers alone.
    async fn update_server_status(
        &self,
        target: &ResourceReference,
        status: &ServerStatus,
    ) -> Result<()>;

    async fn update_phase(
        &self,
        target: &ResourceReference,
        phase: EntandoDeploymentPhase,
        observed_generation: Option<i64>,
    ) -> Result<()>;
}

// ── Retry ─────────────────────────────────────────────────────────────────────

fn is_retryable(e: &kube::Error, retry_not_found: bool) -> bool {
    match e {
        kube::Error::Api(ae) => ae.code == 409 || (retry_not_found && ae.code == 404),
        _ => false,
    }
}

/// Run `op` until it succeeds, retrying optimistic-lock conflicts (and, when
/// asked, 404s seen while a CRD is still being registered) with exponential
/// backoff.
pub async fn with_retry<T, F, Fut>(what: &str, retry_not_found: bool, mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < MAX_ATTEMPTS && is_retryable(&e, retry_not_found) => {
                debug!(%what, attempt, %e, "retrying after transient API error");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// JSON merge patch that turns `old` into `new`: keys missing from `new`
/// are nulled so stale values are removed.
pub fn merge_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut out = serde_json::Map::new();
            for (k, v) in n {
                let diff = match o.get(k) {
                    Some(prev) => merge_diff(prev, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), diff);
            }
            for k in o.keys() {
                if !n.contains_key(k) {
                    out.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(out)
        }
        _ => new.clone(),
    }
}

// ── kube-rs implementation ────────────────────────────────────────────────────

/// Production [`K8sClient`] backed by `kube::Api`.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn custom_resources(&self, target: &ResourceReference) -> Api<DynamicObject> {
        let (group, version) = target.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &target.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &target.plural);
        Api::namespaced_with(self.client.clone(), &target.namespace, &ar)
    }

    async fn get_opt<K>(&self, ns: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        api.get_opt(name).await.on_resource(&K::kind(&()), ns, name)
    }

    /// Server-side apply, forcing ownership of the fields we manage.
    async fn apply<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        let kind = K::kind(&());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let patch = Patch::Apply(obj);
        with_retry(&format!("apply {kind} {ns}/{name}"), false, || {
            api.patch(&name, &params, &patch)
        })
        .await
        .on_resource(&kind, &ns, &name)
    }

    /// Create unless present; returns whichever object ends up persisted.
    async fn create_if_absent<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let kind = K::kind(&()).to_string();
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        if let Some(existing) = api.get_opt(&name).await.on_resource(&kind, &ns, &name)? {
            return Ok(existing);
        }
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            // Lost a race with another writer: theirs is authoritative.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.get(&name).await.on_resource(&kind, &ns, &name)
            }
            Err(e) => Err(Error::from(e).on_resource(&kind, &ns, &name)),
        }
    }
}

#[async_trait]
impl K8sClient for KubeClient {
    async fn load_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt(ns, name).await
    }

    async fn create_secret_if_absent(&self, secret: &Secret) -> Result<Secret> {
        self.create_if_absent(secret).await
    }

    async fn load_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get_opt(ns, name).await
    }

    async fn apply_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.create_if_absent(pvc).await
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount> {
        self.apply(sa).await
    }

    async fn apply_role(&self, role: &Role) -> Result<Role> {
        self.apply(role).await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<RoleBinding> {
        self.apply(binding).await
    }

    async fn apply_service(&self, svc: &Service) -> Result<Service> {
        self.apply(svc).await
    }

    async fn load_ingress(&self, ns: &str, name: &str) -> Result<Option<Ingress>> {
        self.get_opt(ns, name).await
    }

    async fn apply_ingress(&self, ingress: &Ingress) -> Result<Ingress> {
        self.apply(ingress).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.apply(deployment).await
    }

    async fn load_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>> {
        self.get_opt(ns, name).await
    }

    async fn list_pods(&self, ns: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .on_resource("Pod", ns, label_selector)?;
        Ok(pods.items)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let ns = job.namespace().unwrap_or_default();
        let name = job
            .metadata
            .name
            .clone()
            .or_else(|| job.metadata.generate_name.clone())
            .unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), job)
            .await
            .on_resource("Job", &ns, &name)
    }

    async fn load_job(&self, ns: &str, name: &str) -> Result<Option<Job>> {
        self.get_opt(ns, name).await
    }

    async fn delete_jobs(&self, ns: &str, label_selector: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        api.delete_collection(
            &DeleteParams::background(),
            &ListParams::default().labels(label_selector),
        )
        .await
        .on_resource("Job", ns, label_selector)?;
        Ok(())
    }

    async fn list_database_services(&self, ns: &str) -> Result<Vec<EntandoDatabaseService>> {
        let api: Api<EntandoDatabaseService> = Api::namespaced(self.client.clone(), ns);
        let list = api
            .list(&ListParams::default())
            .await
            .on_resource("EntandoDatabaseService", ns, "")?;
        Ok(list.items)
    }

    async fn load_keycloak_server(&self, ns: &str, name: &str) -> Result<Option<EntandoKeycloakServer>> {
        self.get_opt(ns, name).await
    }

    async fn list_keycloak_servers(&self) -> Result<Vec<EntandoKeycloakServer>> {
        let api: Api<EntandoKeycloakServer> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .on_resource("EntandoKeycloakServer", "", "")?;
        Ok(list.items)
    }

    async fn load_status(&self, target: &ResourceReference) -> Result<EntandoCustomResourceStatus> {
        let api = self.custom_resources(target);
        let obj = with_retry(&format!("read status of {}", target.name), true, || {
            api.get_status(&target.name)
        })
        .await
        .on_resource(&target.kind, &target.namespace, &target.name)?;
        match obj.data.get("status") {
            Some(status) if !status.is_null() => Ok(serde_json::from_value(status.clone())?),
            _ => Ok(EntandoCustomResourceStatus::default()),
        }
    }

    async fn update_server_status(
        &self,
        target: &ResourceReference,
        status: &ServerStatus,
    ) -> Result<()> {
        let api = self.custom_resources(target);
        let new = serde_json::to_value(status)?;
        let qualifier = status.qualifier.clone();
        // Read-modify-write guarded by resourceVersion; conflicts re-read.
        with_retry(
            &format!("update {qualifier} status of {}", target.name),
            true,
            || {
                let api = api.clone();
                let new = new.clone();
                let qualifier = qualifier.clone();
                async move {
                    let current = api.get_status(&target.name).await?;
                    let old = current
                        .data
                        .pointer(&format!("/status/serverStatuses/{qualifier}"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let patch = json!({
                        "metadata": { "resourceVersion": current.resource_version() },
                        "status": { "serverStatuses": { qualifier: merge_diff(&old, &new) } }
                    });
                    api.patch_status(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                }
            },
        )
        .await
        .on_resource(&target.kind, &target.namespace, &target.name)?;
        Ok(())
    }

    async fn update_phase(
        &self,
        target: &ResourceReference,
        phase: EntandoDeploymentPhase,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        let api = self.custom_resources(target);
        let mut patch = json!({
            "status": {
                "phase": phase,
                "entandoDeploymentPhase": phase,
            }
        });
        if let Some(generation) = observed_generation {
            patch["status"]["observedGeneration"] = json!(generation);
        }
        let params = PatchParams::default();
        let patch = Patch::Merge(&patch);
        let result = with_retry(&format!("update phase of {}", target.name), true, || {
            api.patch_status(&target.name, &params, &patch)
        })
        .await;
        if let Err(ref e) = result {
            warn!(name = %target.name, %e, "failed to update phase");
        }
        result
            .map(|_| ())
            .on_resource(&target.kind, &target.namespace, &target.name)
    }
}
