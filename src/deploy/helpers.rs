//! Object-construction helpers shared by the creators and the deployables.
//!
//! Pure naming and crypto helpers live in `crate::helpers` instead.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{
        Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Secret, SecretKeySelector,
    },
};
use kube::api::ObjectMeta;

use crate::crd::ResourceReference;

/// Label carried by every object belonging to one qualifier's deployment.
pub const DEPLOYMENT_LABEL: &str = "entando.org/deployment";
pub const OWNER_KIND_LABEL: &str = "entando.org/owner-kind";
pub const OWNER_NAME_LABEL: &str = "entando.org/owner-name";
/// Label identifying the schema preparation jobs of one qualifier.
pub const DB_PREPARATION_LABEL: &str = "entando.org/db-preparation";

/// Shorthand for a plain-value `EnvVar`.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build an `EnvVar` that reads its value from a Secret key.
pub fn secret_env(env_name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: env_name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.into(),
                key: key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Labels identifying a qualifier's objects and their owner.
pub fn deployment_labels(owner: &ResourceReference, qualifier: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            DEPLOYMENT_LABEL.to_string(),
            crate::helpers::deployment_label(&owner.name, qualifier),
        ),
        (OWNER_KIND_LABEL.to_string(), owner.kind.clone()),
        (OWNER_NAME_LABEL.to_string(), owner.name.clone()),
    ])
}

/// Label selector matching the pods of a qualifier's deployment.
pub fn deployment_selector(owner: &ResourceReference, qualifier: &str) -> String {
    format!(
        "{DEPLOYMENT_LABEL}={}",
        crate::helpers::deployment_label(&owner.name, qualifier)
    )
}

/// Metadata for a namespaced child object controlled by `owner`.
pub fn owned_meta(owner: &ResourceReference, name: &str, qualifier: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(owner.namespace.clone()),
        labels: Some(deployment_labels(owner, qualifier)),
        owner_references: Some(vec![owner.owner_reference()]),
        ..Default::default()
    }
}

/// An Opaque secret holding a username and password.
pub fn credentials_secret(
    owner: &ResourceReference,
    qualifier: &str,
    name: &str,
    username: &str,
    password: &str,
) -> Secret {
    Secret {
        metadata: owned_meta(owner, name, qualifier),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ])),
        ..Default::default()
    }
}

/// Read a key from a Secret, from `data` or from not yet persisted `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).to_string())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key).cloned())
        })
}

// ── JobBuilder ────────────────────────────────────────────────────────────────

/// Builder for the run-to-completion Jobs the operator launches.
///
/// Jobs are never retried by Kubernetes (`backoffLimit: 0`): a failed run is
/// surfaced to the reconciliation loop, which owns the retry policy.
pub struct JobBuilder {
    generate_name: String,
    owner: ResourceReference,
    labels: BTreeMap<String, String>,
    containers: Vec<Container>,
    active_deadline: Option<i64>,
}

impl JobBuilder {
    pub fn new(generate_name_prefix: &str, owner: &ResourceReference) -> Self {
        Self {
            generate_name: generate_name_prefix.to_string(),
            owner: owner.clone(),
            labels: BTreeMap::new(),
            containers: vec![],
            active_deadline: None,
        }
    }

    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn containers(mut self, containers: Vec<Container>) -> Self {
        self.containers = containers;
        self
    }

    /// Set `spec.activeDeadlineSeconds` on the Job.
    pub fn active_deadline(mut self, seconds: i64) -> Self {
        self.active_deadline = Some(seconds);
        self
    }

    pub fn build(self) -> Job {
        Job {
            metadata: ObjectMeta {
                generate_name: Some(self.generate_name),
                namespace: Some(self.owner.namespace.clone()),
                labels: Some(self.labels.clone()),
                owner_references: Some(vec![self.owner.owner_reference()]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(900),
                active_deadline_seconds: self.active_deadline,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: self.containers,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
