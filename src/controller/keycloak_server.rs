//! EntandoKeycloakServer controller.

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

use crate::crd::entando_keycloak_server::EntandoKeycloakServer;
use crate::crd::EntandoCustomResource;
use crate::deploy::{DeployCommand, DeploymentResult};
use crate::deployables::keycloak::{
    internal_base_url, keycloak_admin_secret, keycloak_deployable, keycloak_ingress,
    KEYCLOAK_CONTEXT, KEYCLOAK_QUALIFIER,
};
use crate::error::{Result, ResultExt};
use crate::helpers::admin_secret_name;
use crate::keycloak::{ENTANDO_PUBLIC_CLIENT, ENTANDO_REALM};

use super::capabilities::{login, resolve_database};
use super::{error_policy, reconcile_resource, Context, Operator};

/// Start the EntandoKeycloakServer controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let servers: Api<EntandoKeycloakServer> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    Controller::new(servers, WatcherConfig::default())
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

async fn reconcile(server: Arc<EntandoKeycloakServer>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_resource(
        server.as_ref(),
        &ctx,
        KEYCLOAK_QUALIFIER,
        deploy_keycloak_server(&ctx.operator, &server),
    )
    .await
}

pub async fn deploy_keycloak_server(op: &Operator, server: &EntandoKeycloakServer) -> Result<()> {
    let owner = server.reference();
    let ns = owner.namespace.as_str();

    keycloak_ingress(server, &op.config)?;

    // The admin secret must exist before the first login, whatever happens
    // to the rest of the pass.
    let admin_secret = admin_secret_name(&owner.name);
    op.k8s
        .create_secret_if_absent(&keycloak_admin_secret(&owner))
        .await?;

    let images = op.image_resolver().await?;
    let dbms = op.config.effective_dbms(server.spec.dbms);
    let database = if dbms.is_external_server() {
        Some(resolve_database(op, &owner, dbms, server.spec.storage_class.as_deref(), &images).await?)
    } else {
        None
    };

    let deployable = keycloak_deployable(server, dbms, database, &op.config)?;
    let result = DeployCommand::new(&deployable, &op.config, &images)
        .execute(op.k8s.as_ref(), None)
        .await?;

    let mut status = result.status().clone();
    let external_url = status
        .external_base_url
        .as_deref()
        .map(|base| format!("{base}{KEYCLOAK_CONTEXT}"));

    let keycloak = login(op, &internal_base_url(&owner.name, ns), ns, &admin_secret).await?;
    keycloak
        .ensure_realm(ENTANDO_REALM)
        .await
        .on_resource("KeycloakRealm", ns, ENTANDO_REALM)?;
    if let Some(url) = &external_url {
        keycloak
            .create_public_client(ENTANDO_REALM, ENTANDO_PUBLIC_CLIENT, url)
            .await
            .on_resource("KeycloakClient", ns, ENTANDO_PUBLIC_CLIENT)?;
    }

    status.admin_secret_name = Some(admin_secret);
    status.external_base_url = external_url;
    op.k8s.update_server_status(&owner, &status).await?;
    info!(name = %owner.name, %ns, "keycloak server ready");
    Ok(())
}
