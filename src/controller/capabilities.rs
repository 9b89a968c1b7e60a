//! Resolution of the database and SSO capabilities a resource depends on.
//!
//! A database is provided by an EntandoDatabaseService of the requested
//! vendor in the resource's namespace, or else deployed for the resource
//! itself with a nested [`DeployCommand`] under the `db` qualifier.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::info;

use crate::crd::entando_database_service::EntandoDatabaseService;
use crate::crd::entando_keycloak_server::EntandoKeycloakServer;
use crate::crd::shared::{DbmsVendor, KeycloakToUse};
use crate::crd::status::EntandoDeploymentPhase;
use crate::crd::{EntandoCustomResource, ResourceReference};
use crate::deploy::database::VendorStrategy;
use crate::deploy::helpers::secret_value;
use crate::deploy::{DatabaseConnectionInfo, DeployCommand, KeycloakConnection};
use crate::deployables::database::{
    database_admin_secret_name, default_database_name, DatabaseDeployable, DB_QUALIFIER,
};
use crate::deployables::internal_hostname;
use crate::deployables::keycloak::{internal_base_url, KEYCLOAK_QUALIFIER};
use crate::error::{Error, Result};
use crate::helpers::{admin_secret_name, standard_name, SERVICE_SUFFIX};
use crate::images::ImageResolver;
use crate::keycloak::{KeycloakClient, ENTANDO_PUBLIC_CLIENT, ENTANDO_REALM};

use super::Operator;

/// How consumers reach the database described by an EntandoDatabaseService.
/// Both the deployed and the external flavour are exposed through the
/// Service `<name>-db-service`.
pub fn database_service_connection(dbs: &EntandoDatabaseService) -> Result<DatabaseConnectionInfo> {
    let name = dbs.name_any();
    let ns = dbs.namespace().unwrap_or_default();
    let spec = &dbs.spec;
    let strategy = VendorStrategy::of(spec.dbms).ok_or_else(|| {
        Error::config(format!(
            "EntandoDatabaseService {ns}/{name} uses {} which is not a database server",
            spec.dbms
        ))
    })?;
    let admin_secret_name = if spec.create_deployment {
        database_admin_secret_name(&name)
    } else {
        spec.secret_name.clone().ok_or_else(|| {
            Error::config(format!(
                "EntandoDatabaseService {ns}/{name} has no secretName for its external database"
            ))
        })?
    };
    Ok(DatabaseConnectionInfo {
        vendor: spec.dbms,
        internal_service_hostname: internal_hostname(
            &standard_name(&name, DB_QUALIFIER, SERVICE_SUFFIX),
            &ns,
        ),
        port: spec.port.unwrap_or(strategy.default_port),
        database_name: spec
            .database_name
            .clone()
            .unwrap_or_else(|| default_database_name(&name)),
        admin_secret_name,
        tablespace: spec.tablespace.clone(),
        jdbc_parameters: spec.jdbc_parameters.clone().unwrap_or_else(BTreeMap::new),
    })
}

fn database_service_is_ready(dbs: &EntandoDatabaseService) -> bool {
    dbs.entando_status().and_then(|s| s.phase) == Some(EntandoDeploymentPhase::Successful)
}

/// The database `owner` keeps its schemas on. An EntandoDatabaseService of
/// the same vendor is only used once it has deployed successfully.
pub async fn resolve_database(
    op: &Operator,
    owner: &ResourceReference,
    vendor: DbmsVendor,
    storage_class: Option<&str>,
    images: &ImageResolver,
) -> Result<DatabaseConnectionInfo> {
    if !vendor.is_external_server() {
        return Ok(DatabaseConnectionInfo::embedded());
    }

    let services = op.k8s.list_database_services(&owner.namespace).await?;
    let candidates: Vec<&EntandoDatabaseService> =
        services.iter().filter(|s| s.spec.dbms == vendor).collect();
    if let Some(dbs) = candidates.iter().find(|s| database_service_is_ready(s)) {
        info!(name = %owner.name, ns = %owner.namespace, database_service = %dbs.name_any(), %vendor, "using EntandoDatabaseService");
        return database_service_connection(dbs);
    }
    if let Some(dbs) = candidates.first() {
        let phase = dbs
            .entando_status()
            .and_then(|s| s.phase)
            .map_or_else(|| "unknown".to_string(), |p| p.to_string());
        return Err(Error::config(format!(
            "EntandoDatabaseService {}/{} for {vendor} is not available yet (phase {phase})",
            owner.namespace,
            dbs.name_any()
        )));
    }

    info!(name = %owner.name, ns = %owner.namespace, %vendor, "deploying a dedicated database");
    let deployable = DatabaseDeployable::new(owner.clone(), vendor, None, storage_class, Vec::new())?;
    let result = DeployCommand::new(&deployable, &op.config, images)
        .execute(op.k8s.as_ref(), None)
        .await?;
    Ok(result.connection)
}

/// A Keycloak server selected for a resource, and how to administer it.
#[derive(Clone, Debug)]
pub struct ResolvedKeycloak {
    pub connection: KeycloakConnection,
    pub admin_secret_namespace: String,
    pub admin_secret_name: String,
}

/// The Keycloak server named by `keycloak_to_use`, or the one marked
/// `default` when none is named. The server must have been deployed already.
pub async fn resolve_keycloak(
    op: &Operator,
    namespace: &str,
    keycloak_to_use: Option<&KeycloakToUse>,
) -> Result<ResolvedKeycloak> {
    let server = match keycloak_to_use.and_then(|k| k.name.as_deref()) {
        Some(name) => {
            let ns = keycloak_to_use
                .and_then(|k| k.namespace.as_deref())
                .unwrap_or(namespace);
            op.k8s.load_keycloak_server(ns, name).await?.ok_or_else(|| {
                Error::config(format!("EntandoKeycloakServer {ns}/{name} does not exist"))
            })?
        }
        None => default_keycloak_server(op.k8s.list_keycloak_servers().await?)?,
    };
    keycloak_connection(&server, keycloak_to_use)
}

fn default_keycloak_server(servers: Vec<EntandoKeycloakServer>) -> Result<EntandoKeycloakServer> {
    servers
        .into_iter()
        .find(|s| s.spec.default)
        .ok_or_else(|| {
            Error::config(
                "no keycloakToUse was specified and no EntandoKeycloakServer is marked as default",
            )
        })
}

fn keycloak_connection(
    server: &EntandoKeycloakServer,
    keycloak_to_use: Option<&KeycloakToUse>,
) -> Result<ResolvedKeycloak> {
    let name = server.name_any();
    let ns = server.namespace().unwrap_or_default();
    let status = server
        .status
        .as_ref()
        .and_then(|s| s.server_status(KEYCLOAK_QUALIFIER));
    let base_url = status
        .and_then(|s| s.external_base_url.clone())
        .ok_or_else(|| {
            Error::config(format!(
                "EntandoKeycloakServer {ns}/{name} has not been deployed yet"
            ))
        })?;
    Ok(ResolvedKeycloak {
        connection: KeycloakConnection {
            base_url,
            internal_base_url: internal_base_url(&name, &ns),
            realm: keycloak_to_use
                .and_then(|k| k.realm.clone())
                .unwrap_or_else(|| ENTANDO_REALM.to_string()),
            public_client_id: keycloak_to_use
                .and_then(|k| k.public_client_id.clone())
                .unwrap_or_else(|| ENTANDO_PUBLIC_CLIENT.to_string()),
        },
        admin_secret_name: status
            .and_then(|s| s.admin_secret_name.clone())
            .unwrap_or_else(|| admin_secret_name(&name)),
        admin_secret_namespace: ns,
    })
}

/// Log in to a Keycloak server with the credentials of its admin Secret.
pub async fn login(
    op: &Operator,
    internal_base_url: &str,
    secret_namespace: &str,
    secret_name: &str,
) -> Result<Arc<dyn KeycloakClient>> {
    let secret = op
        .k8s
        .load_secret(secret_namespace, secret_name)
        .await?
        .ok_or_else(|| {
            Error::config(format!(
                "Keycloak admin secret {secret_namespace}/{secret_name} does not exist"
            ))
        })?;
    let credential = |key: &str| {
        secret_value(&secret, key).ok_or_else(|| {
            Error::config(format!(
                "Keycloak admin secret {secret_namespace}/{secret_name} has no {key}"
            ))
        })
    };
    let username = credential("username")?;
    let password = credential("password")?;
    op.keycloak
        .login(internal_base_url, &username, &password)
        .await
}

/// Log in to the Keycloak server chosen by [`resolve_keycloak`].
pub async fn login_resolved(op: &Operator, resolved: &ResolvedKeycloak) -> Result<Arc<dyn KeycloakClient>> {
    login(
        op,
        &resolved.connection.internal_base_url,
        &resolved.admin_secret_namespace,
        &resolved.admin_secret_name,
    )
    .await
}
