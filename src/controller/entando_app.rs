//! EntandoApp controller.
//!
//! An app is three qualifiers sharing one Ingress and one database:
//! `server`, then `ab`, then `cm`. Once all three are up, the component
//! manager's service account is granted `superuser` on the server client.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
};
use tracing::{info, warn};

use crate::crd::entando_app::EntandoApp;
use crate::crd::EntandoCustomResource;
use crate::deploy::DeployCommand;
use crate::deployables::app::{
    app_ingress, component_manager_client_id, superuser_permission, AppContext,
    SERVER_QUALIFIER,
};
use crate::error::{Result, ResultExt};

use super::capabilities::{login_resolved, resolve_database, resolve_keycloak};
use super::{error_policy, reconcile_resource, Context, Operator};

/// Start the EntandoApp controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let apps: Api<EntandoApp> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    Controller::new(apps, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("reconciled {:?}", o),
                Err(e) => warn!("reconcile failed: {}", e),
            }
        })
        .await;
}

async fn reconcile(app: Arc<EntandoApp>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_resource(
        app.as_ref(),
        &ctx,
        SERVER_QUALIFIER,
        deploy_app(&ctx.operator, &app),
    )
    .await
}

pub async fn deploy_app(op: &Operator, app: &EntandoApp) -> Result<()> {
    let owner = app.reference();
    let ns = owner.namespace.as_str();
    let images = op.image_resolver().await?;

    // Configuration checks, before any cluster write.
    let sso = resolve_keycloak(op, ns, app.spec.keycloak_to_use.as_ref()).await?;
    let keycloak = login_resolved(op, &sso).await?;
    let realm = sso.connection.realm.clone();
    app_ingress(app, &op.config)?;

    let dbms = op.config.effective_dbms(app.spec.dbms);
    let database = resolve_database(op, &owner, dbms, app.spec.storage_class.as_deref(), &images).await?;

    let ctx = AppContext {
        app,
        database,
        keycloak: sso.connection,
        config: &op.config,
    };

    // Qualifiers, in order.
    for deployable in [ctx.server()?, ctx.app_builder()?, ctx.component_manager()?] {
        DeployCommand::new(&deployable, &op.config, &images)
            .execute(op.k8s.as_ref(), Some(keycloak.as_ref()))
            .await?;
    }

    // Post-deploy.
    let cm_client = component_manager_client_id(&owner.name);
    keycloak
        .assign_role_to_client_service_account(&realm, &cm_client, &superuser_permission(&owner.name))
        .await
        .on_resource("KeycloakClient", ns, &cm_client)?;
    info!(name = %owner.name, %ns, "entando app ready");
    Ok(())
}
