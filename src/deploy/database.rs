//! Database schema preparation.
//!
//! Before DbAware containers start, every schema they ask for is created by a
//! run-to-completion Job (one container per schema) against the admin
//! credentials of the target database. The schema-creation image is
//! idempotent, so re-running the Job on every reconciliation is safe. Schema
//! credentials live in Secrets that are created once and never rotated.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::{batch::v1::Job, core::v1::{Container, EnvVar}};
use kube::ResourceExt;
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::shared::DbmsVendor;
use crate::crd::status::ServerStatus;
use crate::crd::ResourceReference;
use crate::error::{Error, Result};
use crate::helpers::{generate_password, schema_secret_name, schema_username};
use crate::images::ImageResolver;
use crate::k8s::K8sClient;

use super::helpers::{credentials_secret, env, secret_env, secret_value, JobBuilder, DB_PREPARATION_LABEL};
use super::wait::poll_until;

/// Image that runs the vendor-specific `CREATE ... IF NOT EXISTS` logic.
pub const DB_JOB_IMAGE: &str = "entando/entando-k8s-dbjob";
/// Data directory of embedded databases inside application containers.
pub const EMBEDDED_DATA_DIR: &str = "/entando-data/databases";
const EMBEDDED_USERNAME: &str = "agile";

// ── Vendor dispatch ───────────────────────────────────────────────────────────

/// Per-vendor connection settings. The checker and sorter names are opaque
/// strings consumed by the JEE datasource pools of the application images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VendorStrategy {
    pub vendor: DbmsVendor,
    pub default_port: i32,
    pub admin_user: &'static str,
    pub max_username_length: usize,
    pub connection_checker: &'static str,
    pub exception_sorter: &'static str,
}

const MYSQL: VendorStrategy = VendorStrategy {
    vendor: DbmsVendor::Mysql,
    default_port: 3306,
    admin_user: "root",
    max_username_length: 32,
    connection_checker: "org.jboss.jca.adapters.jdbc.extensions.mysql.MySQLValidConnectionChecker",
    exception_sorter: "org.jboss.jca.adapters.jdbc.extensions.mysql.MySQLExceptionSorter",
};

const POSTGRESQL: VendorStrategy = VendorStrategy {
    vendor: DbmsVendor::Postgresql,
    default_port: 5432,
    admin_user: "postgres",
    max_username_length: 63,
    connection_checker: "org.jboss.jca.adapters.jdbc.extensions.postgres.PostgreSQLValidConnectionChecker",
    exception_sorter: "org.jboss.jca.adapters.jdbc.extensions.postgres.PostgreSQLExceptionSorter",
};

const ORACLE: VendorStrategy = VendorStrategy {
    vendor: DbmsVendor::Oracle,
    default_port: 1521,
    admin_user: "system",
    max_username_length: 30,
    connection_checker: "org.jboss.jca.adapters.jdbc.extensions.oracle.OracleValidConnectionChecker",
    exception_sorter: "org.jboss.jca.adapters.jdbc.extensions.oracle.OracleExceptionSorter",
};

const EMBEDDED: VendorStrategy = VendorStrategy {
    vendor: DbmsVendor::Embedded,
    default_port: 0,
    admin_user: EMBEDDED_USERNAME,
    max_username_length: 128,
    connection_checker: "org.jboss.jca.adapters.jdbc.extensions.novendor.NullValidConnectionChecker",
    exception_sorter: "org.jboss.jca.adapters.jdbc.extensions.novendor.NullExceptionSorter",
};

impl VendorStrategy {
    /// Strategy for a vendor; `None` for [`DbmsVendor::None`].
    pub fn of(vendor: DbmsVendor) -> Option<&'static VendorStrategy> {
        match vendor {
            DbmsVendor::Mysql => Some(&MYSQL),
            DbmsVendor::Postgresql => Some(&POSTGRESQL),
            DbmsVendor::Oracle => Some(&ORACLE),
            DbmsVendor::Embedded => Some(&EMBEDDED),
            DbmsVendor::None => None,
        }
    }

    pub fn jdbc_url(
        &self,
        host: &str,
        port: i32,
        database: &str,
        schema: &str,
        parameters: &BTreeMap<String, String>,
    ) -> String {
        let query = if parameters.is_empty() {
            String::new()
        } else {
            let joined: Vec<String> = parameters.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("?{}", joined.join("&"))
        };
        match self.vendor {
            // MySQL has no schemas inside a database: each schema is a database.
            DbmsVendor::Mysql => format!("jdbc:mysql://{host}:{port}/{schema}{query}"),
            DbmsVendor::Postgresql => format!("jdbc:postgresql://{host}:{port}/{database}{query}"),
            DbmsVendor::Oracle => format!("jdbc:oracle:thin:@//{host}:{port}/{database}"),
            DbmsVendor::Embedded | DbmsVendor::None => {
                format!("jdbc:derby:{EMBEDDED_DATA_DIR}/{schema};create=true")
            }
        }
    }
}

// ── Connection model ──────────────────────────────────────────────────────────

/// A database server reachable from the target namespace, with the admin
/// Secret schema preparation logs in with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConnectionInfo {
    pub vendor: DbmsVendor,
    pub internal_service_hostname: String,
    pub port: i32,
    pub database_name: String,
    pub admin_secret_name: String,
    pub tablespace: Option<String>,
    pub jdbc_parameters: BTreeMap<String, String>,
}

impl DatabaseConnectionInfo {
    /// An in-container database: nothing to prepare.
    pub fn embedded() -> Self {
        Self {
            vendor: DbmsVendor::Embedded,
            internal_service_hostname: String::new(),
            port: 0,
            database_name: String::new(),
            admin_secret_name: String::new(),
            tablespace: None,
            jdbc_parameters: BTreeMap::new(),
        }
    }
}

/// A prepared schema and how to connect to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseSchemaCreationResult {
    pub vendor: DbmsVendor,
    pub internal_service_hostname: String,
    pub port: i32,
    pub database_name: String,
    pub schema_name: String,
    /// Secret with the schema's `username` and `password`. Embedded schemas have none.
    pub schema_secret_name: Option<String>,
    pub jdbc_parameters: BTreeMap<String, String>,
}

impl DatabaseSchemaCreationResult {
    fn strategy(&self) -> &'static VendorStrategy {
        VendorStrategy::of(self.vendor).unwrap_or(&EMBEDDED)
    }

    pub fn jdbc_url(&self) -> String {
        self.strategy().jdbc_url(
            &self.internal_service_hostname,
            self.port,
            &self.database_name,
            &self.schema_name,
            &self.jdbc_parameters,
        )
    }

    pub fn connection_checker(&self) -> &'static str {
        self.strategy().connection_checker
    }

    pub fn exception_sorter(&self) -> &'static str {
        self.strategy().exception_sorter
    }

    pub fn username_variable(&self, name: &str) -> EnvVar {
        match &self.schema_secret_name {
            Some(secret) => secret_env(name, secret, "username"),
            None => env(name, EMBEDDED_USERNAME),
        }
    }

    pub fn password_variable(&self, name: &str) -> EnvVar {
        match &self.schema_secret_name {
            Some(secret) => secret_env(name, secret, "password"),
            None => env(name, EMBEDDED_USERNAME),
        }
    }
}

// ── Preparation pipeline ──────────────────────────────────────────────────────

/// Phase of a Job as recorded in `ServerStatus.podPhases`.
pub fn job_phase(job: &Job) -> &'static str {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        "Succeeded"
    } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        "Failed"
    } else if status.and_then(|s| s.active).unwrap_or(0) > 0 {
        "Running"
    } else {
        "Pending"
    }
}

fn embedded_results(schemas: &BTreeSet<String>) -> BTreeMap<String, DatabaseSchemaCreationResult> {
    schemas
        .iter()
        .map(|schema| {
            (
                schema.clone(),
                DatabaseSchemaCreationResult {
                    vendor: DbmsVendor::Embedded,
                    internal_service_hostname: String::new(),
                    port: 0,
                    database_name: schema.clone(),
                    schema_name: schema.clone(),
                    schema_secret_name: None,
                    jdbc_parameters: BTreeMap::new(),
                },
            )
        })
        .collect()
}

fn schema_creation_container(
    database: &DatabaseConnectionInfo,
    image: &str,
    schema: &str,
    secret_name: &str,
) -> Container {
    let mut env_vars = vec![
        env("DATABASE_SERVER_HOST", database.internal_service_hostname.clone()),
        env("DATABASE_SERVER_PORT", database.port.to_string()),
        secret_env("DATABASE_ADMIN_USER", &database.admin_secret_name, "username"),
        secret_env("DATABASE_ADMIN_PASSWORD", &database.admin_secret_name, "password"),
        env("DATABASE_NAME", database.database_name.clone()),
        env("DATABASE_VENDOR", database.vendor.to_string()),
        env("DATABASE_SCHEMA_COMMAND", "CREATE_SCHEMA"),
        secret_env("DATABASE_USER", secret_name, "username"),
        secret_env("DATABASE_PASSWORD", secret_name, "password"),
    ];
    if !database.jdbc_parameters.is_empty() {
        let joined: Vec<String> = database
            .jdbc_parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env_vars.push(env("JDBC_PARAMETERS", joined.join(",")));
    }
    if let Some(tablespace) = &database.tablespace {
        env_vars.push(env("TABLESPACE", tablespace.clone()));
    }
    Container {
        name: format!("{schema}-schema-creation-job"),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(env_vars),
        ..Default::default()
    }
}

/// Everything schema preparation needs for one deployable.
pub struct SchemaPreparation<'a> {
    pub owner: &'a ResourceReference,
    pub qualifier: &'a str,
    pub database: &'a DatabaseConnectionInfo,
    pub schemas: BTreeSet<String>,
    pub images: &'a ImageResolver,
    pub config: &'a OperatorConfig,
}

impl SchemaPreparation<'_> {
    /// Create the schemas and return how to connect to each. The Job's phase
    /// is written to `status` whether or not it succeeds.
    pub async fn run(
        &self,
        k8s: &dyn K8sClient,
        status: &mut ServerStatus,
    ) -> Result<BTreeMap<String, DatabaseSchemaCreationResult>> {
        if !self.database.vendor.is_external_server() {
            return Ok(embedded_results(&self.schemas));
        }
        let strategy = VendorStrategy::of(self.database.vendor).ok_or_else(|| {
            Error::illegal_state(format!("no strategy for vendor {}", self.database.vendor))
        })?;
        let ns = &self.owner.namespace;

        let mut results = BTreeMap::new();
        let mut containers = Vec::new();
        let image = self.images.determine_image_uri(DB_JOB_IMAGE, None);
        for schema in &self.schemas {
            let secret_name = schema_secret_name(&self.owner.name, schema);
            let username = schema_username(&self.owner.name, schema, strategy.max_username_length);
            let desired = credentials_secret(
                self.owner,
                self.qualifier,
                &secret_name,
                &username,
                &generate_password(),
            );
            let secret = k8s.create_secret_if_absent(&desired).await?;
            let schema_name = secret_value(&secret, "username").unwrap_or(username);

            containers.push(schema_creation_container(
                self.database,
                &image,
                schema,
                &secret_name,
            ));
            results.insert(
                schema.clone(),
                DatabaseSchemaCreationResult {
                    vendor: self.database.vendor,
                    internal_service_hostname: self.database.internal_service_hostname.clone(),
                    port: self.database.port,
                    database_name: self.database.database_name.clone(),
                    schema_name,
                    schema_secret_name: Some(secret_name),
                    jdbc_parameters: self.database.jdbc_parameters.clone(),
                },
            );
        }

        let label_value = crate::helpers::deployment_label(&self.owner.name, self.qualifier);
        let selector = format!("{DB_PREPARATION_LABEL}={label_value}");
        k8s.delete_jobs(ns, &selector).await?;

        let job = JobBuilder::new(
            &format!("{}-{}-db-preparation-", self.owner.name, self.qualifier),
            self.owner,
        )
        .labels(BTreeMap::from([(DB_PREPARATION_LABEL.to_string(), label_value)]))
        .containers(containers)
        .active_deadline(self.config.pod_completion_timeout.as_secs() as i64)
        .build();
        let created = k8s.create_job(&job).await?;
        let job_name = created.name_any();
        info!(%ns, job = %job_name, schemas = ?self.schemas, "waiting for schema preparation");
        status
            .pod_phases
            .insert(job_name.clone(), job_phase(&created).to_string());

        let outcome = poll_until(
            self.config.poll_interval,
            self.config.pod_completion_timeout,
            &format!("waiting for Job {ns}/{job_name} to complete"),
            || {
                let job_name = job_name.clone();
                async move {
                    let job = k8s.load_job(ns, &job_name).await?;
                    Ok(job.filter(|j| matches!(job_phase(j), "Succeeded" | "Failed")))
                }
            },
        )
        .await;

        let finished = match outcome {
            Ok(job) => job,
            Err(e) => {
                if let Ok(Some(job)) = k8s.load_job(ns, &job_name).await {
                    status
                        .pod_phases
                        .insert(job_name.clone(), job_phase(&job).to_string());
                }
                return Err(e.on_resource("Job", ns, &job_name));
            }
        };
        let phase = job_phase(&finished);
        status.pod_phases.insert(job_name.clone(), phase.to_string());
        if phase == "Failed" {
            warn!(%ns, job = %job_name, "schema preparation failed");
            return Err(Error::ResourceCreation(format!(
                "schema preparation Job {job_name} failed"
            ))
            .on_resource("Job", ns, &job_name));
        }

        for (schema, result) in &results {
            status.put_derived_parameter(format!("{schema}JdbcUrl"), result.jdbc_url());
        }
        Ok(results)
    }
}
