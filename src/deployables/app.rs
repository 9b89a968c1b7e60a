//! The three qualifiers of an EntandoApp: the application server (`server`),
//! the App Builder UI (`ab`) and the component manager (`cm`). They share one
//! Ingress and authenticate against the same Keycloak realm.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::rbac::v1::PolicyRule;

use crate::config::{ComplianceMode, OperatorConfig};
use crate::crd::entando_app::{EntandoApp, JeeServer};
use crate::crd::{EntandoCustomResource, ResourceReference, ENTANDO_GROUP};
use crate::deploy::helpers::env;
use crate::deploy::{
    DatabaseConnectionInfo, DatabaseSchemaCreationResult, DbAware, DeployableContainer,
    IngressRequirements, IngressingContainer, KeycloakAware, KeycloakConnection,
    PersistentVolumeAware, ServiceAccountRequirements, TlsAware,
};
use crate::error::Result;
use crate::helpers::{standard_name, SERVICE_SUFFIX};
use crate::keycloak::{ExpectedRole, KeycloakClientConfig, Permission};

use super::{ingress_requirements, internal_hostname, spec_variables, ServiceDeployable};

pub const SERVER_QUALIFIER: &str = "server";
pub const APP_BUILDER_QUALIFIER: &str = "ab";
pub const COMPONENT_MANAGER_QUALIFIER: &str = "cm";

pub const SERVER_CONTEXT: &str = "/entando-de-app";
pub const APP_BUILDER_CONTEXT: &str = "/app-builder/";
pub const COMPONENT_MANAGER_CONTEXT: &str = "/digital-exchange";

pub const SERVER_PORT: i32 = 8080;
pub const APP_BUILDER_PORT: i32 = 8081;
pub const COMPONENT_MANAGER_PORT: i32 = 8083;

/// Client role the component manager needs on the server's client.
pub const SUPERUSER_ROLE: &str = "superuser";
/// ServiceAccount the component manager runs as unless the app names one.
pub const DEFAULT_DEPLOYER_ACCOUNT: &str = "entando-deployer";

pub fn server_client_id(app_name: &str) -> String {
    format!("{app_name}-{SERVER_QUALIFIER}")
}

pub fn component_manager_client_id(app_name: &str) -> String {
    format!("{app_name}-de")
}

/// The permission granted to the component manager once both are deployed.
pub fn superuser_permission(app_name: &str) -> Permission {
    Permission::new(server_client_id(app_name), SUPERUSER_ROLE)
}

fn schema_variables(prefix: &str, schema: &DatabaseSchemaCreationResult) -> Vec<EnvVar> {
    vec![
        env(&format!("{prefix}_URL"), schema.jdbc_url()),
        schema.username_variable(&format!("{prefix}_USERNAME")),
        schema.password_variable(&format!("{prefix}_PASSWORD")),
        env(
            &format!("{prefix}_CONNECTION_CHECKER"),
            schema.connection_checker(),
        ),
        env(
            &format!("{prefix}_EXCEPTION_SORTER"),
            schema.exception_sorter(),
        ),
    ]
}

// ── server ────────────────────────────────────────────────────────────────────

struct AppServerContainer {
    repository: &'static str,
    custom_image: Option<String>,
    web_context: String,
    app_name: String,
    ingress: IngressRequirements,
    keycloak: KeycloakConnection,
    storage_class: Option<String>,
    extra_env: Vec<EnvVar>,
}

impl DeployableContainer for AppServerContainer {
    fn name_qualifier(&self) -> &str {
        SERVER_QUALIFIER
    }

    fn image_repository(&self) -> &str {
        self.repository
    }

    fn custom_image(&self) -> Option<&str> {
        self.custom_image.as_deref()
    }

    fn primary_port(&self) -> i32 {
        SERVER_PORT
    }

    fn memory_limit_mebibytes(&self) -> i32 {
        1792
    }

    fn cpu_limit_millicores(&self) -> i32 {
        1500
    }

    fn environment_variables(&self) -> Vec<EnvVar> {
        let mut vars = vec![env("ENTANDO_WEB_CONTEXT", self.web_context.clone())];
        vars.extend(self.extra_env.iter().cloned());
        vars
    }

    fn as_ingressing(&self) -> Option<&dyn IngressingContainer> {
        Some(self)
    }

    fn as_db_aware(&self) -> Option<&dyn DbAware> {
        Some(self)
    }

    fn as_tls_aware(&self) -> Option<&dyn TlsAware> {
        Some(self)
    }

    fn as_persistent_volume_aware(&self) -> Option<&dyn PersistentVolumeAware> {
        Some(self)
    }

    fn as_keycloak_aware(&self) -> Option<&dyn KeycloakAware> {
        Some(self)
    }
}

impl IngressingContainer for AppServerContainer {
    fn web_context_path(&self) -> &str {
        &self.web_context
    }
}

impl DbAware for AppServerContainer {
    fn database_schema_qualifiers(&self) -> Vec<String> {
        vec!["portdb".to_string(), "servdb".to_string()]
    }

    fn database_connection_variables(
        &self,
        schemas: &BTreeMap<String, DatabaseSchemaCreationResult>,
    ) -> Vec<EnvVar> {
        schemas
            .iter()
            .filter(|(q, _)| matches!(q.as_str(), "portdb" | "servdb"))
            .flat_map(|(q, schema)| schema_variables(&q.to_ascii_uppercase(), schema))
            .collect()
    }
}

impl TlsAware for AppServerContainer {}

impl PersistentVolumeAware for AppServerContainer {
    fn volume_mount_path(&self) -> &str {
        "/entando-data"
    }

    fn storage_class(&self) -> Option<&str> {
        self.storage_class.as_deref()
    }
}

impl KeycloakAware for AppServerContainer {
    fn keycloak_connection(&self) -> &KeycloakConnection {
        &self.keycloak
    }

    fn keycloak_client_config(&self) -> KeycloakClientConfig {
        let base = self.ingress.external_base_url();
        KeycloakClientConfig::new(
            &self.keycloak.realm,
            server_client_id(&self.app_name),
            format!("Entando App {}", self.app_name),
        )
        .with_redirect_uri(format!("{base}{}/*", self.web_context))
        .with_web_origin(base)
        .with_role(ExpectedRole::new(SUPERUSER_ROLE, "Superuser"))
    }
}

// ── ab ────────────────────────────────────────────────────────────────────────

struct AppBuilderContainer {
    server_context: String,
    keycloak: KeycloakConnection,
    extra_env: Vec<EnvVar>,
}

impl DeployableContainer for AppBuilderContainer {
    fn name_qualifier(&self) -> &str {
        APP_BUILDER_QUALIFIER
    }

    fn image_repository(&self) -> &str {
        "entando/app-builder"
    }

    fn primary_port(&self) -> i32 {
        APP_BUILDER_PORT
    }

    fn memory_limit_mebibytes(&self) -> i32 {
        512
    }

    fn cpu_limit_millicores(&self) -> i32 {
        500
    }

    fn environment_variables(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            env("DOMAIN", self.server_context.clone()),
            env("KEYCLOAK_URL", self.keycloak.base_url.clone()),
            env("KEYCLOAK_REALM", self.keycloak.realm.clone()),
            env("KEYCLOAK_CLIENT_ID", self.keycloak.public_client_id.clone()),
        ];
        vars.extend(self.extra_env.iter().cloned());
        vars
    }

    fn as_ingressing(&self) -> Option<&dyn IngressingContainer> {
        Some(self)
    }

    fn as_tls_aware(&self) -> Option<&dyn TlsAware> {
        Some(self)
    }
}

impl IngressingContainer for AppBuilderContainer {
    fn web_context_path(&self) -> &str {
        APP_BUILDER_CONTEXT
    }

    // The context root redirects to the login page.
    fn health_check_path(&self) -> String {
        format!("{APP_BUILDER_CONTEXT}favicon-entando.png")
    }
}

impl TlsAware for AppBuilderContainer {}

// ── cm ────────────────────────────────────────────────────────────────────────

struct ComponentManagerContainer {
    app_name: String,
    server_url: String,
    ingress: IngressRequirements,
    keycloak: KeycloakConnection,
    extra_env: Vec<EnvVar>,
}

impl DeployableContainer for ComponentManagerContainer {
    fn name_qualifier(&self) -> &str {
        COMPONENT_MANAGER_QUALIFIER
    }

    fn image_repository(&self) -> &str {
        "entando/entando-component-manager"
    }

    fn primary_port(&self) -> i32 {
        COMPONENT_MANAGER_PORT
    }

    fn memory_limit_mebibytes(&self) -> i32 {
        768
    }

    fn cpu_limit_millicores(&self) -> i32 {
        750
    }

    fn environment_variables(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            env("SERVER_SERVLET_CONTEXT_PATH", COMPONENT_MANAGER_CONTEXT),
            env("ENTANDO_APP_NAME", self.app_name.clone()),
            env("ENTANDO_URL", self.server_url.clone()),
            env(
                "SPRING_SECURITY_OAUTH2_CLIENT_PROVIDER_OIDC_ISSUER_URI",
                format!("{}/realms/{}", self.keycloak.base_url, self.keycloak.realm),
            ),
        ];
        vars.extend(self.extra_env.iter().cloned());
        vars
    }

    fn as_ingressing(&self) -> Option<&dyn IngressingContainer> {
        Some(self)
    }

    fn as_db_aware(&self) -> Option<&dyn DbAware> {
        Some(self)
    }

    fn as_tls_aware(&self) -> Option<&dyn TlsAware> {
        Some(self)
    }

    fn as_keycloak_aware(&self) -> Option<&dyn KeycloakAware> {
        Some(self)
    }
}

impl IngressingContainer for ComponentManagerContainer {
    fn web_context_path(&self) -> &str {
        COMPONENT_MANAGER_CONTEXT
    }
}

impl DbAware for ComponentManagerContainer {
    fn database_schema_qualifiers(&self) -> Vec<String> {
        vec!["dedb".to_string()]
    }

    fn database_connection_variables(
        &self,
        schemas: &BTreeMap<String, DatabaseSchemaCreationResult>,
    ) -> Vec<EnvVar> {
        let Some(schema) = schemas.get("dedb") else {
            return Vec::new();
        };
        vec![
            env("SPRING_DATASOURCE_URL", schema.jdbc_url()),
            schema.username_variable("SPRING_DATASOURCE_USERNAME"),
            schema.password_variable("SPRING_DATASOURCE_PASSWORD"),
        ]
    }
}

impl TlsAware for ComponentManagerContainer {}

impl KeycloakAware for ComponentManagerContainer {
    fn keycloak_connection(&self) -> &KeycloakConnection {
        &self.keycloak
    }

    fn keycloak_client_config(&self) -> KeycloakClientConfig {
        let base = self.ingress.external_base_url();
        KeycloakClientConfig::new(
            &self.keycloak.realm,
            component_manager_client_id(&self.app_name),
            format!("Entando Component Manager {}", self.app_name),
        )
        .with_redirect_uri(format!("{base}{COMPONENT_MANAGER_CONTEXT}/*"))
        .with_web_origin(base)
    }
}

// ── Deployables ───────────────────────────────────────────────────────────────

/// The Ingress shared by the three qualifiers of an app.
pub fn app_ingress(app: &EntandoApp, config: &OperatorConfig) -> Result<IngressRequirements> {
    ingress_requirements(
        &app.reference(),
        app.spec.ingress_host_name.as_deref(),
        app.spec.tls_secret_name.as_deref(),
        config,
    )
}

/// Everything resolved for an EntandoApp before its qualifiers are built.
pub struct AppContext<'a> {
    pub app: &'a EntandoApp,
    pub database: DatabaseConnectionInfo,
    pub keycloak: KeycloakConnection,
    pub config: &'a OperatorConfig,
}

impl AppContext<'_> {
    fn owner(&self) -> ResourceReference {
        self.app.reference()
    }

    fn ingress(&self) -> Result<IngressRequirements> {
        app_ingress(self.app, self.config)
    }

    fn server_context(&self) -> String {
        self.app
            .spec
            .ingress_path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| SERVER_CONTEXT.to_string())
    }

    fn base(&self, qualifier: &str) -> Result<ServiceDeployable> {
        let mut deployable = ServiceDeployable::new(self.owner(), qualifier);
        deployable.ingress = Some(self.ingress()?);
        deployable.storage_class = self.app.spec.storage_class.clone();
        Ok(deployable)
    }

    /// `server`: the Entando application server.
    pub fn server(&self) -> Result<ServiceDeployable> {
        let spec = &self.app.spec;
        let jee = spec.standard_server_image.unwrap_or(match self.config.compliance_mode {
            ComplianceMode::RedHat => JeeServer::Eap,
            ComplianceMode::Community => JeeServer::Wildfly,
        });
        let mut deployable = self.base(SERVER_QUALIFIER)?;
        deployable.replicas = spec.replicas;
        deployable.database = Some(self.database.clone());
        deployable.containers.push(Box::new(AppServerContainer {
            repository: jee.image_repository(),
            custom_image: spec.custom_server_image.clone(),
            web_context: self.server_context(),
            app_name: self.app.metadata.name.clone().unwrap_or_default(),
            ingress: self.ingress()?,
            keycloak: self.keycloak.clone(),
            storage_class: spec.storage_class.clone(),
            extra_env: spec_variables(&spec.environment_variables),
        }));
        Ok(deployable)
    }

    /// `ab`: the App Builder UI.
    pub fn app_builder(&self) -> Result<ServiceDeployable> {
        let mut deployable = self.base(APP_BUILDER_QUALIFIER)?;
        deployable.containers.push(Box::new(AppBuilderContainer {
            server_context: self.server_context(),
            keycloak: self.keycloak.clone(),
            extra_env: Vec::new(),
        }));
        Ok(deployable)
    }

    /// `cm`: the component manager, which deploys bundles and so needs RBAC on
    /// the Entando resources of its namespace.
    pub fn component_manager(&self) -> Result<ServiceDeployable> {
        let owner = self.owner();
        let mut deployable = self.base(COMPONENT_MANAGER_QUALIFIER)?;
        deployable.database = Some(self.database.clone());
        deployable.service_account = Some(ServiceAccountRequirements {
            name: self
                .app
                .spec
                .service_account_to_use
                .clone()
                .unwrap_or_else(|| DEFAULT_DEPLOYER_ACCOUNT.to_string()),
            rules: vec![PolicyRule {
                api_groups: Some(vec![ENTANDO_GROUP.to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                ..Default::default()
            }],
        });
        let server_service = standard_name(&owner.name, SERVER_QUALIFIER, SERVICE_SUFFIX);
        deployable.containers.push(Box::new(ComponentManagerContainer {
            app_name: owner.name.clone(),
            server_url: format!(
                "http://{}:{SERVER_PORT}{}",
                internal_hostname(&server_service, &owner.namespace),
                self.server_context()
            ),
            ingress: self.ingress()?,
            keycloak: self.keycloak.clone(),
            extra_env: Vec::new(),
        }));
        Ok(deployable)
    }
}
