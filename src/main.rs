//! entando-k8s-operator: deploys Entando apps, Keycloak servers and
//! database services.
//!
//! The three controllers run as concurrent tokio tasks within a single
//! binary, sharing a common Context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::info;
use warp::Filter;

use entando_k8s_operator::config::{
    ComplianceMode, ImageCoordinates, OperatorConfig, RequestToLimitRatios,
};
use entando_k8s_operator::controller::{self, Context, Operator};
use entando_k8s_operator::k8s::KubeClient;
use entando_k8s_operator::keycloak::HttpKeycloakConnector;

const RELATED_IMAGE_PREFIX: &str = "RELATED_IMAGE_";

#[derive(Parser, Debug)]
#[command(
    name = "entando-k8s-operator",
    about = "Kubernetes operator for Entando apps, Keycloak servers and databases"
)]
struct Args {
    /// Namespace where the operator is deployed (image info, CA secret).
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    operator_namespace: String,

    /// "community" or "redhat": selects the default DBMS and images.
    #[arg(
        long,
        default_value = "community",
        env = "ENTANDO_K8S_OPERATOR_COMPLIANCE_MODE"
    )]
    compliance_mode: ComplianceMode,

    /// Request-to-limit ratio applied to memory and CPU.
    #[arg(
        long,
        default_value_t = RequestToLimitRatios::DEFAULT,
        env = "ENTANDO_K8S_OPERATOR_REQUEST_TO_LIMIT_RATIO"
    )]
    request_to_limit_ratio: f64,

    #[arg(long, env = "ENTANDO_K8S_OPERATOR_MEMORY_REQUEST_TO_LIMIT_RATIO")]
    memory_request_to_limit_ratio: Option<f64>,

    #[arg(long, env = "ENTANDO_K8S_OPERATOR_CPU_REQUEST_TO_LIMIT_RATIO")]
    cpu_request_to_limit_ratio: Option<f64>,

    /// Emit resource limits and requests on containers.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "ENTANDO_K8S_OPERATOR_IMPOSE_LIMITS"
    )]
    impose_limits: bool,

    /// Bound on database preparation jobs.
    #[arg(long, default_value_t = 600, env = "ENTANDO_POD_COMPLETION_TIMEOUT_SECONDS")]
    pod_completion_timeout_seconds: u64,

    /// Bound on waiting for a Ready pod.
    #[arg(long, default_value_t = 600, env = "ENTANDO_POD_READINESS_TIMEOUT_SECONDS")]
    pod_readiness_timeout_seconds: u64,

    #[arg(long, default_value_t = 2000, env = "ENTANDO_POD_POLL_INTERVAL_MILLIS")]
    pod_poll_interval_millis: u64,

    /// Host suffix for resources without an ingress host name.
    #[arg(long, env = "ENTANDO_DEFAULT_ROUTING_SUFFIX")]
    default_routing_suffix: Option<String>,

    #[arg(long, env = "ENTANDO_TLS_SECRET_NAME")]
    tls_secret_name: Option<String>,

    /// CA bundle Secret in the operator namespace.
    #[arg(long, env = "ENTANDO_CA_SECRET_NAME")]
    ca_secret_name: Option<String>,

    #[arg(long, env = "ENTANDO_DEFAULT_STORAGE_CLASS")]
    default_storage_class: Option<String>,

    #[arg(
        long,
        default_value = "entando-docker-image-info",
        env = "ENTANDO_DOCKER_IMAGE_INFO_CONFIGMAP"
    )]
    docker_image_info_configmap: String,

    #[arg(long, env = "ENTANDO_DOCKER_REGISTRY_OVERRIDE")]
    docker_registry_override: Option<String>,

    #[arg(long, env = "ENTANDO_DOCKER_REGISTRY_FALLBACK")]
    docker_registry_fallback: Option<String>,

    #[arg(long, env = "ENTANDO_DOCKER_IMAGE_ORG_OVERRIDE")]
    docker_image_org_override: Option<String>,

    #[arg(long, env = "ENTANDO_DOCKER_IMAGE_ORG_FALLBACK")]
    docker_image_org_fallback: Option<String>,

    #[arg(long, env = "ENTANDO_DOCKER_IMAGE_VERSION_OVERRIDE")]
    docker_image_version_override: Option<String>,

    #[arg(long, env = "ENTANDO_DOCKER_IMAGE_VERSION_FALLBACK")]
    docker_image_version_fallback: Option<String>,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

impl Args {
    fn into_config(self, related_images: BTreeMap<String, String>) -> OperatorConfig {
        OperatorConfig {
            operator_namespace: self.operator_namespace,
            compliance_mode: self.compliance_mode,
            request_to_limit_ratios: RequestToLimitRatios::new(
                self.request_to_limit_ratio,
                self.memory_request_to_limit_ratio,
                self.cpu_request_to_limit_ratio,
            ),
            impose_limits: self.impose_limits,
            pod_completion_timeout: Duration::from_secs(self.pod_completion_timeout_seconds),
            pod_readiness_timeout: Duration::from_secs(self.pod_readiness_timeout_seconds),
            poll_interval: Duration::from_millis(self.pod_poll_interval_millis),
            default_routing_suffix: self.default_routing_suffix,
            default_tls_secret_name: self.tls_secret_name,
            ca_secret_name: self.ca_secret_name,
            default_storage_class: self.default_storage_class,
            image_info_config_map: self.docker_image_info_configmap,
            image_overrides: ImageCoordinates {
                registry: self.docker_registry_override,
                organization: self.docker_image_org_override,
                version: self.docker_image_version_override,
            },
            image_fallbacks: ImageCoordinates {
                registry: self.docker_registry_fallback,
                organization: self.docker_image_org_fallback,
                version: self.docker_image_version_fallback,
            },
            related_images,
        }
    }
}

/// `RELATED_IMAGE_*` variables, keyed by the part after the prefix.
fn related_images() -> BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(RELATED_IMAGE_PREFIX)
                .map(|suffix| (suffix.to_string(), value))
        })
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // Parse health probe bind address (e.g. ":8081" or "0.0.0.0:8081").
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| args.health_probe_bind_address.clone())
        .parse()
        .context("invalid --health-probe-bind-address")?;

    let config = Arc::new(args.into_config(related_images()));
    let client = Client::try_default().await?;

    info!(
        ns = %config.operator_namespace,
        compliance = %config.compliance_mode,
        "starting entando-k8s-operator"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let ctx = Arc::new(Context {
        client: client.clone(),
        operator: Operator {
            k8s: Arc::new(KubeClient::new(client)),
            keycloak: Arc::new(HttpKeycloakConnector::new(http)),
            config,
        },
        reporter: Reporter {
            controller: "entando-k8s-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        },
    });

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    tokio::select! {
        _ = controller::database_service::run(ctx.clone()) => {},
        _ = controller::keycloak_server::run(ctx.clone()) => {},
        _ = controller::entando_app::run(ctx.clone()) => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
    }

    Ok(())
}
