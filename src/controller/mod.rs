//! Controllers for the Entando custom resources.
//!
//! Every controller follows the same cycle: skip resources whose current
//! generation is already deployed, mark the resource `started`, resolve the
//! capabilities it depends on, run one or more [`DeployCommand`]s and finally
//! write the terminal phase together with the observed generation.
//!
//! [`DeployCommand`]: crate::deploy::DeployCommand

pub mod capabilities;
pub mod database_service;
pub mod entando_app;
pub mod keycloak_server;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::{
        controller::Action,
        events::{Event as KubeEvent, EventType, Recorder, Reporter},
    },
    Client, Resource, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::status::{
    EntandoControllerFailure, EntandoDeploymentPhase, ServerStatus, ServerStatusType,
};
use crate::crd::{EntandoCustomResource, ResourceReference};
use crate::error::{Error, Result};
use crate::images::ImageResolver;
use crate::k8s::K8sClient;
use crate::keycloak::KeycloakConnector;

/// Delay before a failed resource is reconciled again.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// The collaborators a reconciliation needs, without the event machinery.
#[derive(Clone)]
pub struct Operator {
    pub k8s: Arc<dyn K8sClient>,
    pub keycloak: Arc<dyn KeycloakConnector>,
    pub config: Arc<OperatorConfig>,
}

impl Operator {
    /// Image resolver over the image-info ConfigMap as it is right now. A
    /// missing ConfigMap only means there are no per-image entries.
    pub async fn image_resolver(&self) -> Result<ImageResolver> {
        let data = self
            .k8s
            .load_config_map(&self.config.operator_namespace, &self.config.image_info_config_map)
            .await?
            .and_then(|cm| cm.data)
            .unwrap_or_default();
        Ok(ImageResolver::new(&self.config, &data))
    }
}

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context {
    pub client: Client,
    pub operator: Operator,
    pub reporter: Reporter,
}

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Publish a Kubernetes event attached to the given resource.
/// Errors are logged but never block reconciliation.
pub async fn publish_event<K: Resource<DynamicType = ()>>(
    ctx: &Context,
    obj: &K,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let rec = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let oref = kube_object_ref(obj);
    if let Err(e) = rec
        .publish(
            &KubeEvent {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            },
            &oref,
        )
        .await
    {
        warn!(%e, "failed to publish event");
    }
}

/// Requeue failed reconciliations after [`FAILURE_BACKOFF`].
pub fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(name = %obj.name_any(), ns = ?obj.namespace(), %error, "reconcile failed");
    Action::requeue(FAILURE_BACKOFF)
}

/// Remaining wait when the current generation failed less than
/// [`FAILURE_BACKOFF`] ago. Status writes of the failed pass trigger watch
/// events of their own, which must not restart the pipeline immediately.
pub fn failure_backoff<K: EntandoCustomResource>(resource: &K) -> Option<Duration> {
    let status = resource.entando_status()?;
    if status.phase != Some(EntandoDeploymentPhase::Failed)
        || status.observed_generation != resource.meta().generation
    {
        return None;
    }
    let elapsed = (Utc::now() - status.last_finished()?).to_std().unwrap_or_default();
    FAILURE_BACKOFF.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Run one deployment pass for `target` and write its terminal phase.
///
/// On failure the error is recorded on the `main_qualifier` ServerStatus
/// unless a step of this pass already recorded one, then the phase becomes
/// `failed` and the error is returned to the caller.
pub async fn reconcile_status<Fut>(
    k8s: &dyn K8sClient,
    target: &ResourceReference,
    main_qualifier: &str,
    work: Fut,
) -> Result<EntandoDeploymentPhase>
where
    Fut: Future<Output = Result<()>>,
{
    let pass_started = Utc::now();
    k8s.update_phase(target, EntandoDeploymentPhase::Started, None)
        .await?;

    match work.await {
        Ok(()) => {
            let status = k8s.load_status(target).await?;
            let phase = if status.has_failed_since(pass_started) {
                EntandoDeploymentPhase::Failed
            } else {
                EntandoDeploymentPhase::Successful
            };
            k8s.update_phase(target, phase, target.generation).await?;
            Ok(phase)
        }
        Err(e) => {
            let status = k8s.load_status(target).await.unwrap_or_default();
            if !status.has_failed_since(pass_started) {
                let mut server = status
                    .server_status(main_qualifier)
                    .cloned()
                    .unwrap_or_else(|| {
                        ServerStatus::started_now(main_qualifier, ServerStatusType::WebServerStatus)
                    });
                server.started = Some(Utc::now());
                server.finished = None;
                server.entando_controller_failure = None;
                server.finish_with(EntandoControllerFailure::from_error(&e, target));
                if let Err(pe) = k8s.update_server_status(target, &server).await {
                    warn!(name = %target.name, error = %pe, "could not record failure");
                }
            }
            if let Err(pe) = k8s
                .update_phase(target, EntandoDeploymentPhase::Failed, target.generation)
                .await
            {
                warn!(name = %target.name, error = %pe, "could not mark resource failed");
            }
            Err(e)
        }
    }
}

/// The controller-side wrapper around [`reconcile_status`]: skip up-to-date
/// resources, honour the failure backoff and publish events.
pub async fn reconcile_resource<K, Fut>(
    resource: &K,
    ctx: &Context,
    main_qualifier: &str,
    work: Fut,
) -> Result<Action>
where
    K: EntandoCustomResource,
    Fut: Future<Output = Result<()>>,
{
    let target = ResourceReference::of(resource);
    if resource.is_up_to_date() {
        debug!(kind = %target.kind, name = %target.name, ns = %target.namespace, "already deployed");
        return Ok(Action::await_change());
    }
    if let Some(wait) = failure_backoff(resource) {
        debug!(kind = %target.kind, name = %target.name, ?wait, "backing off after failure");
        return Ok(Action::requeue(wait));
    }

    info!(kind = %target.kind, name = %target.name, ns = %target.namespace, generation = ?target.generation, "deploying");
    publish_event(ctx, resource, EventType::Normal, "Deploying", "Deploy", None).await;

    match reconcile_status(ctx.operator.k8s.as_ref(), &target, main_qualifier, work).await {
        Ok(EntandoDeploymentPhase::Successful) => {
            info!(kind = %target.kind, name = %target.name, ns = %target.namespace, "deployed");
            publish_event(ctx, resource, EventType::Normal, "Deployed", "Deploy", None).await;
            Ok(Action::await_change())
        }
        Ok(phase) => {
            warn!(kind = %target.kind, name = %target.name, %phase, "deployment did not succeed");
            publish_event(
                ctx,
                resource,
                EventType::Warning,
                "DeploymentFailed",
                "Deploy",
                Some("a server status recorded a failure".to_string()),
            )
            .await;
            Ok(Action::requeue(FAILURE_BACKOFF))
        }
        Err(e) => {
            publish_event(
                ctx,
                resource,
                EventType::Warning,
                "DeploymentFailed",
                "Deploy",
                Some(e.to_string()),
            )
            .await;
            Err(e)
        }
    }
}
