//! EntandoDatabaseService controller.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Service, ServicePort, ServiceSpec},
};
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    ResourceExt,
};
use tracing::{info, warn};

use crate::crd::entando_database_service::EntandoDatabaseService;
use crate::crd::status::{ServerStatus, ServerStatusType};
use crate::crd::EntandoCustomResource;
use crate::deploy::database::VendorStrategy;
use crate::deploy::helpers::owned_meta;
use crate::deploy::DeployCommand;
use crate::deployables::database::{DatabaseDeployable, DB_QUALIFIER};
use crate::deployables::spec_variables;
use crate::error::{Error, Result};
use crate::helpers::{standard_name, SERVICE_SUFFIX};

use super::{error_policy, reconcile_resource, Context, Operator};

/// Start the EntandoDatabaseService controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let services: Api<EntandoDatabaseService> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    Controller::new(services, WatcherConfig::default())
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

async fn reconcile(dbs: Arc<EntandoDatabaseService>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_resource(
        dbs.as_ref(),
        &ctx,
        DB_QUALIFIER,
        deploy_database_service(&ctx.operator, &dbs),
    )
    .await
}

/// Deploy the database, or expose the external one under `<name>-db-service`.
pub async fn deploy_database_service(op: &Operator, dbs: &EntandoDatabaseService) -> Result<()> {
    let owner = dbs.reference();
    let spec = &dbs.spec;

    if spec.create_deployment {
        let images = op.image_resolver().await?;
        let deployable = DatabaseDeployable::new(
            owner,
            spec.dbms,
            spec.database_name.as_deref(),
            spec.storage_class.as_deref(),
            spec_variables(&spec.environment_variables),
        )?;
        DeployCommand::new(&deployable, &op.config, &images)
            .execute(op.k8s.as_ref(), None)
            .await?;
        return Ok(());
    }

    // External database: validate everything before touching the cluster.
    let ns = owner.namespace.as_str();
    let strategy = VendorStrategy::of(spec.dbms)
        .filter(|_| spec.dbms.is_external_server())
        .ok_or_else(|| {
            Error::config(format!(
                "EntandoDatabaseService {ns}/{} must name a database server vendor, not {}",
                owner.name, spec.dbms
            ))
        })?;
    let host = spec.host.as_deref().filter(|h| !h.is_empty()).ok_or_else(|| {
        Error::config(format!(
            "EntandoDatabaseService {ns}/{} needs spec.host when createDeployment is false",
            owner.name
        ))
    })?;
    let secret_name = spec.secret_name.as_deref().ok_or_else(|| {
        Error::config(format!(
            "EntandoDatabaseService {ns}/{} needs spec.secretName when createDeployment is false",
            owner.name
        ))
    })?;
    if op.k8s.load_secret(ns, secret_name).await?.is_none() {
        return Err(Error::config(format!(
            "admin secret {ns}/{secret_name} of EntandoDatabaseService {} does not exist",
            owner.name
        )));
    }

    let mut status = ServerStatus::started_now(DB_QUALIFIER, ServerStatusType::DbServerStatus);
    let service = external_service(dbs, host, spec.port.unwrap_or(strategy.default_port));
    let service = op.k8s.apply_service(&service).await?;
    let service_name = service.name_any();
    status.service_phases.insert(service_name.clone(), "Active".to_string());
    status.service_name = Some(service_name);
    status.admin_secret_name = Some(secret_name.to_string());
    status.finish();
    op.k8s.update_server_status(&owner, &status).await?;
    info!(name = %owner.name, %ns, %host, "external database exposed");
    Ok(())
}

/// `ExternalName` Service pointing at an external database host.
pub fn external_service(dbs: &EntandoDatabaseService, host: &str, port: i32) -> Service {
    let owner = dbs.reference();
    let name = standard_name(&owner.name, DB_QUALIFIER, SERVICE_SUFFIX);
    Service {
        metadata: owned_meta(&owner, &name, DB_QUALIFIER),
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(host.to_string()),
            ports: Some(vec![ServicePort {
                name: Some(format!("{DB_QUALIFIER}-port")),
                port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
