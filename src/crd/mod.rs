//! Entando custom resource definitions.

pub mod entando_app;
pub mod entando_database_service;
pub mod entando_keycloak_server;
pub mod shared;
pub mod status;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use status::EntandoCustomResourceStatus;

/// API group shared by every Entando custom resource.
pub const ENTANDO_GROUP: &str = "entando.org";

/// Identity of a persisted custom resource: enough to address its status
/// subresource and to own the children created on its behalf.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceReference {
    pub api_version: String,
    pub kind: String,
    pub plural: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub generation: Option<i64>,
}

impl ResourceReference {
    /// Reference any kube-rs resource whose type information is static.
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            plural: K::plural(&()).to_string(),
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            uid: obj.meta().uid.clone().unwrap_or_default(),
            generation: obj.meta().generation,
        }
    }

    /// `(group, version)` split from the apiVersion.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Controller OwnerReference, so children are garbage-collected with the resource.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Common accessors over the Entando custom resources.
pub trait EntandoCustomResource: Resource<DynamicType = ()> {
    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus>;

    fn reference(&self) -> ResourceReference
    where
        Self: Sized,
    {
        ResourceReference::of(self)
    }

    /// True once the current generation has been deployed successfully.
    fn is_up_to_date(&self) -> bool {
        self.entando_status().is_some_and(|s| {
            s.phase == Some(status::EntandoDeploymentPhase::Successful)
                && s.observed_generation.is_some()
                && s.observed_generation == self.meta().generation
        })
    }
}
