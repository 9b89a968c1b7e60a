//! Image reference resolution.
//!
//! Precedence for each of registry / organization / version:
//! override setting > explicit caller value > image-info ConfigMap entry >
//! fallback setting > literal default.  A `RELATED_IMAGE_*` entry for the
//! repository replaces the whole reference.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use crate::config::{OperatorConfig, PropertyResolution, PropertySource};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_ORGANIZATION: &str = "entando";
pub const DEFAULT_VERSION: &str = "latest";

/// One entry of the image-info ConfigMap, keyed by repository name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Resolves image references against the operator config and the image-info ConfigMap.
#[derive(Clone, Debug)]
pub struct ImageResolver {
    overrides: crate::config::ImageCoordinates,
    fallbacks: crate::config::ImageCoordinates,
    related_images: BTreeMap<String, String>,
    image_info: BTreeMap<String, ImageInfo>,
}

impl ImageResolver {
    /// Build a resolver from the operator config and the raw ConfigMap data.
    /// Entries that are not valid JSON are logged and ignored.
    pub fn new(config: &OperatorConfig, config_map_data: &BTreeMap<String, String>) -> Self {
        let image_info = config_map_data
            .iter()
            .filter_map(|(key, raw)| match serde_json::from_str::<ImageInfo>(raw) {
                Ok(info) => Some((key.clone(), info)),
                Err(e) => {
                    warn!(%key, %e, "ignoring malformed image info entry");
                    None
                }
            })
            .collect();
        Self {
            overrides: config.image_overrides.clone(),
            fallbacks: config.image_fallbacks.clone(),
            related_images: config.related_images.clone(),
            image_info,
        }
    }

    /// Fully qualified `registry/organization/image:version` for a repository
    /// such as `entando/entando-de-app-wildfly`.  `explicit_version` is a tag
    /// requested by the custom resource itself.
    pub fn determine_image_uri(&self, repository: &str, explicit_version: Option<&str>) -> String {
        let image_name = repository.rsplit('/').next().unwrap_or(repository);
        let related_key = image_name.to_ascii_uppercase().replace(['-', '.'], "_");
        if let Some(uri) = self.related_images.get(&related_key) {
            return uri.clone();
        }

        let info = self.image_info.get(image_name);
        let repo_org = repository
            .rsplit_once('/')
            .map(|(org, _)| org)
            .filter(|org| !org.is_empty());

        let registry = PropertyResolution::new()
            .with(PropertySource::Override, self.overrides.registry.as_deref())
            .with(
                PropertySource::ConfigMap,
                info.and_then(|i| i.registry.as_deref()),
            )
            .with(PropertySource::Fallback, self.fallbacks.registry.as_deref())
            .resolve_or(DEFAULT_REGISTRY);
        let organization = PropertyResolution::new()
            .with(
                PropertySource::Override,
                self.overrides.organization.as_deref(),
            )
            .with(
                PropertySource::ConfigMap,
                info.and_then(|i| i.organization.as_deref()),
            )
            .with(
                PropertySource::Fallback,
                self.fallbacks.organization.as_deref(),
            )
            .with(PropertySource::Default, repo_org)
            .resolve_or(DEFAULT_ORGANIZATION);
        let version = PropertyResolution::new()
            .with(PropertySource::Override, self.overrides.version.as_deref())
            .with(PropertySource::Explicit, explicit_version)
            .with(
                PropertySource::ConfigMap,
                info.and_then(|i| i.version.as_deref()),
            )
            .with(PropertySource::Fallback, self.fallbacks.version.as_deref())
            .resolve_or(DEFAULT_VERSION);

        format!("{registry}/{organization}/{image_name}:{version}")
    }
}
