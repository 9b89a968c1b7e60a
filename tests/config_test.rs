//! Compliance mode parsing and ordered property resolution.

use entando_k8s_operator::config::*;
use entando_k8s_operator::crd::shared::DbmsVendor;

#[test]
fn test_compliance_mode_parses_case_insensitively() {
    assert_eq!("RedHat".parse::<ComplianceMode>().unwrap(), ComplianceMode::RedHat);
    assert_eq!("community".parse::<ComplianceMode>().unwrap(), ComplianceMode::Community);
    assert!("enterprise".parse::<ComplianceMode>().is_err());
}

#[test]
fn test_default_dbms_depends_on_compliance_mode() {
    let mut config = OperatorConfig::default();
    assert_eq!(config.effective_dbms(None), DbmsVendor::Embedded);
    config.compliance_mode = ComplianceMode::RedHat;
    assert_eq!(config.effective_dbms(None), DbmsVendor::Postgresql);
    assert_eq!(config.effective_dbms(Some(DbmsVendor::Mysql)), DbmsVendor::Mysql);
}

#[test]
fn test_per_kind_ratio_overrides_the_global_one() {
    let ratios = RequestToLimitRatios::new(0.2, Some(0.5), None);
    assert_eq!(ratios.memory, 0.5);
    assert_eq!(ratios.cpu, 0.2);
}

#[test]
fn test_resolution_order_ignores_insertion_order() {
    let resolution = PropertyResolution::new()
        .with(PropertySource::Fallback, Some("fallback"))
        .with(PropertySource::ConfigMap, Some("config-map"))
        .with(PropertySource::Override, None);
    let resolved = resolution.resolve();
    assert_eq!(resolved, Some((PropertySource::ConfigMap, "config-map")));
}

#[test]
fn test_blank_values_fall_through_to_the_default() {
    let resolution = PropertyResolution::new()
        .with(PropertySource::Override, Some("  "))
        .with(PropertySource::Fallback, None);
    assert_eq!(resolution.resolve(), None);
    assert_eq!(resolution.resolve_or("latest"), "latest");
}
