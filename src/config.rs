//! Operator-wide settings, resolved once at startup and shared read-only.
//!
//! `main` parses flags / environment variables with clap and hands the result
//! to the library as an [`OperatorConfig`]; nothing below reads the process
//! environment directly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::crd::shared::DbmsVendor;
use crate::error::Error;

/// Whether the operator deploys community images or Red Hat certified ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComplianceMode {
    #[default]
    Community,
    RedHat,
}

impl ComplianceMode {
    /// DBMS used when a resource does not name one.
    pub fn default_dbms(&self) -> DbmsVendor {
        match self {
            ComplianceMode::Community => DbmsVendor::Embedded,
            ComplianceMode::RedHat => DbmsVendor::Postgresql,
        }
    }
}

impl FromStr for ComplianceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "community" => Ok(ComplianceMode::Community),
            "redhat" => Ok(ComplianceMode::RedHat),
            other => Err(Error::config(format!(
                "unknown compliance mode {other:?}, expected 'community' or 'redhat'"
            ))),
        }
    }
}

impl fmt::Display for ComplianceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceMode::Community => write!(f, "community"),
            ComplianceMode::RedHat => write!(f, "redhat"),
        }
    }
}

/// Request-to-limit ratios, one per resource kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestToLimitRatios {
    pub memory: f64,
    pub cpu: f64,
}

impl RequestToLimitRatios {
    pub const DEFAULT: f64 = 0.1;

    /// A global ratio with optional per-kind overrides.
    pub fn new(global: f64, memory: Option<f64>, cpu: Option<f64>) -> Self {
        Self {
            memory: memory.unwrap_or(global),
            cpu: cpu.unwrap_or(global),
        }
    }
}

impl Default for RequestToLimitRatios {
    fn default() -> Self {
        Self::new(Self::DEFAULT, None, None)
    }
}

/// Image coordinates that may be overridden or supplied as a fallback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageCoordinates {
    pub registry: Option<String>,
    pub organization: Option<String>,
    pub version: Option<String>,
}

/// Cluster-specific configuration injected at startup via CLI flags.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub operator_namespace: String,
    pub compliance_mode: ComplianceMode,
    pub request_to_limit_ratios: RequestToLimitRatios,
    pub impose_limits: bool,
    pub pod_completion_timeout: Duration,
    pub pod_readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub default_routing_suffix: Option<String>,
    pub default_tls_secret_name: Option<String>,
    pub ca_secret_name: Option<String>,
    pub default_storage_class: Option<String>,
    pub image_info_config_map: String,
    pub image_overrides: ImageCoordinates,
    pub image_fallbacks: ImageCoordinates,
    /// `RELATED_IMAGE_*` values captured at startup, keyed by the variable suffix.
    pub related_images: BTreeMap<String, String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "default".to_string(),
            compliance_mode: ComplianceMode::default(),
            request_to_limit_ratios: RequestToLimitRatios::default(),
            impose_limits: true,
            pod_completion_timeout: Duration::from_secs(600),
            pod_readiness_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            default_routing_suffix: None,
            default_tls_secret_name: None,
            ca_secret_name: None,
            default_storage_class: None,
            image_info_config_map: "entando-docker-image-info".to_string(),
            image_overrides: ImageCoordinates::default(),
            image_fallbacks: ImageCoordinates::default(),
            related_images: BTreeMap::new(),
        }
    }
}

impl OperatorConfig {
    /// Resolve the DBMS a resource asked for, falling back to the compliance default.
    pub fn effective_dbms(&self, requested: Option<DbmsVendor>) -> DbmsVendor {
        requested.unwrap_or_else(|| self.compliance_mode.default_dbms())
    }
}

// ── Ordered property resolution ───────────────────────────────────────────────

/// Where a property value came from, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropertySource {
    Override,
    Explicit,
    ConfigMap,
    Fallback,
    Default,
}

/// An explicit, ordered list of candidate values. The first source that
/// yields a non-empty value wins.
#[derive(Clone, Debug, Default)]
pub struct PropertyResolution {
    candidates: Vec<(PropertySource, Option<String>)>,
}

impl PropertyResolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: PropertySource, value: Option<&str>) -> Self {
        self.candidates
            .push((source, value.map(|v| v.to_string())));
        self
    }

    /// First non-empty candidate, with the source it came from.
    pub fn resolve(&self) -> Option<(PropertySource, &str)> {
        let mut ordered: Vec<&(PropertySource, Option<String>)> = self.candidates.iter().collect();
        ordered.sort_by_key(|(source, _)| *source);
        ordered.into_iter().find_map(|(source, value)| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| (*source, v))
        })
    }

    pub fn resolve_or(&self, default: &str) -> String {
        self.resolve()
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| default.to_string())
    }
}
