use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{EnvVar, Pod, Secret, Service},
    networking::v1::Ingress,
};

use crate::crd::shared::DbmsVendor;
use crate::crd::status::ServerStatus;
use crate::crd::ResourceReference;
use crate::deploy::database::VendorStrategy;
use crate::deploy::helpers::{credentials_secret, env, secret_env};
use crate::deploy::{
    DatabaseConnectionInfo, Deployable, DeployableContainer, DeploymentResult,
    PersistentVolumeAware, ServiceDeploymentResult,
};
use crate::error::{Error, Result};
use crate::helpers::{generate_password, sanitise_identifier, standard_name, SERVICE_SUFFIX};

use super::internal_hostname;

/// Qualifier of every in-cluster database deployment.
pub const DB_QUALIFIER: &str = "db";

/// Admin Secret of an in-cluster database: `<resourceName>-db-admin-secret`.
pub fn database_admin_secret_name(resource_name: &str) -> String {
    standard_name(resource_name, DB_QUALIFIER, "admin-secret")
}

/// Name of the database created on a server deployed for `resource_name`.
pub fn default_database_name(resource_name: &str) -> String {
    format!("{}_db", sanitise_identifier(resource_name))
}

struct DatabaseContainer {
    vendor: DbmsVendor,
    repository: &'static str,
    port: i32,
    data_path: &'static str,
    admin_secret: String,
    database_name: String,
    storage_class: Option<String>,
    extra_env: Vec<EnvVar>,
}

impl DeployableContainer for DatabaseContainer {
    fn name_qualifier(&self) -> &str {
        DB_QUALIFIER
    }

    fn image_repository(&self) -> &str {
        self.repository
    }

    fn primary_port(&self) -> i32 {
        self.port
    }

    fn memory_limit_mebibytes(&self) -> i32 {
        1024
    }

    fn cpu_limit_millicores(&self) -> i32 {
        1000
    }

    fn environment_variables(&self) -> Vec<EnvVar> {
        let mut vars = match self.vendor {
            DbmsVendor::Mysql => vec![secret_env("MYSQL_ROOT_PASSWORD", &self.admin_secret, "password")],
            _ => vec![
                secret_env("POSTGRESQL_ADMIN_PASSWORD", &self.admin_secret, "password"),
                env("POSTGRESQL_DATABASE", self.database_name.clone()),
                env("POSTGRESQL_USER", format!("{}_owner", self.database_name)),
                secret_env("POSTGRESQL_PASSWORD", &self.admin_secret, "password"),
            ],
        };
        vars.extend(self.extra_env.iter().cloned());
        vars
    }

    fn as_persistent_volume_aware(&self) -> Option<&dyn PersistentVolumeAware> {
        Some(self)
    }
}

impl PersistentVolumeAware for DatabaseContainer {
    fn volume_mount_path(&self) -> &str {
        self.data_path
    }

    fn storage_class(&self) -> Option<&str> {
        self.storage_class.as_deref()
    }
}

/// An in-cluster MySQL or PostgreSQL server with qualifier `db`.
pub struct DatabaseDeployable {
    owner: ResourceReference,
    vendor: DbmsVendor,
    containers: Vec<Box<dyn DeployableContainer>>,
    admin_secret: Secret,
    database_name: String,
    port: i32,
}

impl DatabaseDeployable {
    /// Fails with a configuration error for vendors that cannot be deployed
    /// in-cluster.
    pub fn new(
        owner: ResourceReference,
        vendor: DbmsVendor,
        database_name: Option<&str>,
        storage_class: Option<&str>,
        extra_env: Vec<EnvVar>,
    ) -> Result<Self> {
        let (repository, data_path) = match vendor {
            DbmsVendor::Mysql => ("centos/mysql-80-centos7", "/var/lib/mysql/data"),
            DbmsVendor::Postgresql => ("centos/postgresql-12-centos7", "/var/lib/pgsql/data"),
            other => {
                return Err(Error::config(format!(
                    "{other} databases cannot be deployed by the operator, configure an external EntandoDatabaseService instead"
                )))
            }
        };
        let strategy = VendorStrategy::of(vendor)
            .ok_or_else(|| Error::illegal_state(format!("no strategy for vendor {vendor}")))?;
        let admin_secret_name = database_admin_secret_name(&owner.name);
        let database_name = database_name
            .map(str::to_string)
            .unwrap_or_else(|| default_database_name(&owner.name));
        let admin_secret = credentials_secret(
            &owner,
            DB_QUALIFIER,
            &admin_secret_name,
            strategy.admin_user,
            &generate_password(),
        );
        let container = DatabaseContainer {
            vendor,
            repository,
            port: strategy.default_port,
            data_path,
            admin_secret: admin_secret_name,
            database_name: database_name.clone(),
            storage_class: storage_class.map(str::to_string),
            extra_env,
        };
        Ok(Self {
            owner,
            vendor,
            containers: vec![Box::new(container)],
            admin_secret,
            database_name,
            port: strategy.default_port,
        })
    }

    pub fn service_name(&self) -> String {
        standard_name(&self.owner.name, DB_QUALIFIER, SERVICE_SUFFIX)
    }

    /// How consumers reach the deployed server.
    pub fn connection_info(&self) -> DatabaseConnectionInfo {
        DatabaseConnectionInfo {
            vendor: self.vendor,
            internal_service_hostname: internal_hostname(&self.service_name(), &self.owner.namespace),
            port: self.port,
            database_name: self.database_name.clone(),
            admin_secret_name: database_admin_secret_name(&self.owner.name),
            tablespace: None,
            jdbc_parameters: BTreeMap::new(),
        }
    }
}

/// A deployed database server and how to connect to it.
#[derive(Clone, Debug)]
pub struct DatabaseDeploymentResult {
    pub service: ServiceDeploymentResult,
    pub connection: DatabaseConnectionInfo,
}

impl DeploymentResult for DatabaseDeploymentResult {
    fn with_status(mut self, status: ServerStatus) -> Self {
        self.service = self.service.with_status(status);
        self
    }

    fn status(&self) -> &ServerStatus {
        self.service.status()
    }
}

impl Deployable for DatabaseDeployable {
    type Output = DatabaseDeploymentResult;

    fn custom_resource(&self) -> &ResourceReference {
        &self.owner
    }

    fn name_qualifier(&self) -> &str {
        DB_QUALIFIER
    }

    fn containers(&self) -> &[Box<dyn DeployableContainer>] {
        &self.containers
    }

    fn secrets(&self) -> Vec<Secret> {
        vec![self.admin_secret.clone()]
    }

    fn create_result(
        &self,
        deployment: Option<Deployment>,
        service: Option<Service>,
        ingress: Option<Ingress>,
        pod: Option<Pod>,
    ) -> DatabaseDeploymentResult {
        DatabaseDeploymentResult {
            service: ServiceDeploymentResult::new(deployment, service, ingress, pod),
            connection: self.connection_info(),
        }
    }
}
