use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;

use crate::config::{ComplianceMode, OperatorConfig};
use crate::crd::entando_keycloak_server::{EntandoKeycloakServer, StandardKeycloakImage};
use crate::crd::shared::DbmsVendor;
use crate::crd::{EntandoCustomResource, ResourceReference};
use crate::deploy::helpers::{credentials_secret, env, secret_env};
use crate::deploy::{
    DatabaseConnectionInfo, DatabaseSchemaCreationResult, DbAware, DeployableContainer,
    IngressRequirements, IngressingContainer, PersistentVolumeAware, TlsAware,
};
use crate::error::Result;
use crate::helpers::{admin_secret_name, generate_password, standard_name, SERVICE_SUFFIX};

use super::{ingress_requirements, internal_hostname, spec_variables, ServiceDeployable};

pub const KEYCLOAK_QUALIFIER: &str = "server";
pub const KEYCLOAK_PORT: i32 = 8080;
pub const KEYCLOAK_CONTEXT: &str = "/auth";
/// Username stored in a new admin Secret.
pub const KEYCLOAK_ADMIN_USER: &str = "entando_keycloak_admin";
const DB_SCHEMA: &str = "db";

struct KeycloakContainer {
    repository: &'static str,
    custom_image: Option<String>,
    dbms: DbmsVendor,
    admin_secret: String,
    front_end_url: Option<String>,
    storage_class: Option<String>,
    extra_env: Vec<EnvVar>,
}

fn keycloak_db_vendor(vendor: DbmsVendor) -> &'static str {
    match vendor {
        DbmsVendor::Mysql => "mysql",
        DbmsVendor::Postgresql => "postgres",
        DbmsVendor::Oracle => "oracle",
        DbmsVendor::Embedded | DbmsVendor::None => "h2",
    }
}

impl DeployableContainer for KeycloakContainer {
    fn name_qualifier(&self) -> &str {
        KEYCLOAK_QUALIFIER
    }

    fn image_repository(&self) -> &str {
        self.repository
    }

    fn custom_image(&self) -> Option<&str> {
        self.custom_image.as_deref()
    }

    fn primary_port(&self) -> i32 {
        KEYCLOAK_PORT
    }

    fn memory_limit_mebibytes(&self) -> i32 {
        768
    }

    fn cpu_limit_millicores(&self) -> i32 {
        1000
    }

    fn environment_variables(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            secret_env("KEYCLOAK_USER", &self.admin_secret, "username"),
            secret_env("KEYCLOAK_PASSWORD", &self.admin_secret, "password"),
            env("PROXY_ADDRESS_FORWARDING", "true"),
        ];
        if !self.dbms.is_external_server() {
            vars.push(env("DB_VENDOR", keycloak_db_vendor(self.dbms)));
        }
        if let Some(url) = &self.front_end_url {
            vars.push(env("KEYCLOAK_FRONTEND_URL", url.clone()));
        }
        vars.extend(self.extra_env.iter().cloned());
        vars
    }

    fn as_ingressing(&self) -> Option<&dyn IngressingContainer> {
        Some(self)
    }

    fn as_db_aware(&self) -> Option<&dyn DbAware> {
        self.dbms.is_external_server().then_some(self as &dyn DbAware)
    }

    fn as_tls_aware(&self) -> Option<&dyn TlsAware> {
        Some(self)
    }

    fn as_persistent_volume_aware(&self) -> Option<&dyn PersistentVolumeAware> {
        (!self.dbms.is_external_server()).then_some(self as &dyn PersistentVolumeAware)
    }
}

impl IngressingContainer for KeycloakContainer {
    fn web_context_path(&self) -> &str {
        KEYCLOAK_CONTEXT
    }
}

impl TlsAware for KeycloakContainer {}

impl PersistentVolumeAware for KeycloakContainer {
    fn volume_mount_path(&self) -> &str {
        "/opt/jboss/keycloak/standalone/data"
    }

    fn storage_class(&self) -> Option<&str> {
        self.storage_class.as_deref()
    }
}

impl DbAware for KeycloakContainer {
    fn database_schema_qualifiers(&self) -> Vec<String> {
        vec![DB_SCHEMA.to_string()]
    }

    fn database_connection_variables(
        &self,
        schemas: &BTreeMap<String, DatabaseSchemaCreationResult>,
    ) -> Vec<EnvVar> {
        let Some(schema) = schemas.get(DB_SCHEMA) else {
            return Vec::new();
        };
        // On MySQL the schema is the database.
        let database = if schema.vendor == DbmsVendor::Mysql {
            schema.schema_name.clone()
        } else {
            schema.database_name.clone()
        };
        vec![
            env("DB_VENDOR", keycloak_db_vendor(schema.vendor)),
            env("DB_ADDR", schema.internal_service_hostname.clone()),
            env("DB_PORT", schema.port.to_string()),
            env("DB_DATABASE", database),
            env("DB_SCHEMA", schema.schema_name.clone()),
            schema.username_variable("DB_USER"),
            schema.password_variable("DB_PASSWORD"),
        ]
    }
}

/// Admin Secret of a Keycloak server, created once with a random password.
pub fn keycloak_admin_secret(owner: &ResourceReference) -> k8s_openapi::api::core::v1::Secret {
    credentials_secret(
        owner,
        KEYCLOAK_QUALIFIER,
        &admin_secret_name(&owner.name),
        KEYCLOAK_ADMIN_USER,
        &generate_password(),
    )
}

/// In-cluster base URL of a Keycloak server, including the `/auth` context.
pub fn internal_base_url(name: &str, namespace: &str) -> String {
    let service = standard_name(name, KEYCLOAK_QUALIFIER, SERVICE_SUFFIX);
    format!(
        "http://{}:{KEYCLOAK_PORT}{KEYCLOAK_CONTEXT}",
        internal_hostname(&service, namespace)
    )
}

/// Ingress of an EntandoKeycloakServer. Fails when neither a host nor a
/// default routing suffix is available.
pub fn keycloak_ingress(
    server: &EntandoKeycloakServer,
    config: &OperatorConfig,
) -> Result<IngressRequirements> {
    ingress_requirements(
        &server.reference(),
        server.spec.ingress_host_name.as_deref(),
        server.spec.tls_secret_name.as_deref(),
        config,
    )
}

/// Deployable for an EntandoKeycloakServer. `database` is the server it keeps
/// its schema on, `None` for the embedded H2 store.
pub fn keycloak_deployable(
    server: &EntandoKeycloakServer,
    dbms: DbmsVendor,
    database: Option<DatabaseConnectionInfo>,
    config: &OperatorConfig,
) -> Result<ServiceDeployable> {
    let owner = server.reference();
    let spec = &server.spec;
    let standard = spec.standard_image.unwrap_or(match config.compliance_mode {
        ComplianceMode::RedHat => StandardKeycloakImage::RedhatSso,
        ComplianceMode::Community => StandardKeycloakImage::Keycloak,
    });
    let ingress = keycloak_ingress(server, config)?;
    let container = KeycloakContainer {
        repository: standard.image_repository(),
        custom_image: spec.custom_image.clone(),
        dbms,
        admin_secret: admin_secret_name(&owner.name),
        front_end_url: spec.front_end_url.clone(),
        storage_class: spec.storage_class.clone(),
        extra_env: spec_variables(&spec.environment_variables),
    };

    let mut deployable = ServiceDeployable::new(owner.clone(), KEYCLOAK_QUALIFIER);
    deployable.replicas = spec.replicas;
    deployable.containers.push(Box::new(container));
    deployable.secrets.push(keycloak_admin_secret(&owner));
    deployable.database = database;
    deployable.ingress = Some(ingress);
    deployable.storage_class = spec.storage_class.clone();
    Ok(deployable)
}
