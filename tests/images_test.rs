//! Image resolution precedence.

use std::collections::BTreeMap;

use entando_k8s_operator::config::{ImageCoordinates, OperatorConfig};
use entando_k8s_operator::images::ImageResolver;

fn config_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_literal_defaults() {
    let resolver = ImageResolver::new(&OperatorConfig::default(), &BTreeMap::new());
    assert_eq!(
        resolver.determine_image_uri("entando/app-builder", None),
        "docker.io/entando/app-builder:latest"
    );
}

#[test]
fn test_repository_organization_is_kept_by_default() {
    let resolver = ImageResolver::new(&OperatorConfig::default(), &BTreeMap::new());
    assert_eq!(
        resolver.determine_image_uri("centos/mysql-80-centos7", None),
        "docker.io/centos/mysql-80-centos7:latest"
    );
}

#[test]
fn test_config_map_entry_beats_fallback() {
    let config = OperatorConfig {
        image_fallbacks: ImageCoordinates {
            version: Some("6.0.0".to_string()),
            registry: Some("fallback.example.com".to_string()),
            organization: None,
        },
        ..Default::default()
    };
    let data = config_map(&[("app-builder", r#"{"version":"6.3.2","registry":"registry.example.com"}"#)]);
    let resolver = ImageResolver::new(&config, &data);
    assert_eq!(
        resolver.determine_image_uri("entando/app-builder", None),
        "registry.example.com/entando/app-builder:6.3.2"
    );
    // Images without an entry fall back.
    assert_eq!(
        resolver.determine_image_uri("entando/entando-component-manager", None),
        "fallback.example.com/entando/entando-component-manager:6.0.0"
    );
}

#[test]
fn test_explicit_version_sits_between_override_and_config_map() {
    let data = config_map(&[("app-builder", r#"{"version":"6.3.2"}"#)]);
    let resolver = ImageResolver::new(&OperatorConfig::default(), &data);
    assert_eq!(
        resolver.determine_image_uri("entando/app-builder", Some("7.0.0")),
        "docker.io/entando/app-builder:7.0.0"
    );

    let config = OperatorConfig {
        image_overrides: ImageCoordinates {
            version: Some("9.9.9".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let resolver = ImageResolver::new(&config, &data);
    assert_eq!(
        resolver.determine_image_uri("entando/app-builder", Some("7.0.0")),
        "docker.io/entando/app-builder:9.9.9"
    );
}

#[test]
fn test_related_image_wins_outright() {
    let config = OperatorConfig {
        related_images: BTreeMap::from([(
            "ENTANDO_DE_APP_WILDFLY".to_string(),
            "registry.redhat.io/entando/de-app@sha256:abc".to_string(),
        )]),
        image_overrides: ImageCoordinates {
            version: Some("9.9.9".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let resolver = ImageResolver::new(&config, &BTreeMap::new());
    assert_eq!(
        resolver.determine_image_uri("entando/entando-de-app-wildfly", None),
        "registry.redhat.io/entando/de-app@sha256:abc"
    );
}

#[test]
fn test_malformed_config_map_entries_are_ignored() {
    let data = config_map(&[("app-builder", "not json")]);
    let resolver = ImageResolver::new(&OperatorConfig::default(), &data);
    assert_eq!(
        resolver.determine_image_uri("entando/app-builder", None),
        "docker.io/entando/app-builder:latest"
    );
}
