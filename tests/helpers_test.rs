//! Unit tests for naming, credential and quantity helpers.

use entando_k8s_operator::helpers::*;

// ── Naming ───────────────────────────────────────────────────────────────────

#[test]
fn test_standard_names_include_the_qualifier() {
    assert_eq!(standard_name("my-app", "cm", DEPLOYMENT_SUFFIX), "my-app-cm-deployment");
    assert_eq!(standard_name("my-app", "cm", SERVICE_SUFFIX), "my-app-cm-service");
    assert_eq!(standard_name("my-app", "server", PVC_SUFFIX), "my-app-server-pvc");
}

#[test]
fn test_shared_object_names() {
    assert_eq!(ingress_name("my-app"), "my-app-ingress");
    assert_eq!(admin_secret_name("my-keycloak"), "my-keycloak-admin-secret");
    assert_eq!(schema_secret_name("my-app", "portdb"), "my-app-portdb-secret");
    assert_eq!(keycloak_client_secret_name("my-app-de"), "my-app-de-secret");
    assert_eq!(deployment_label("my-app", "ab"), "my-app-ab");
}

#[test]
fn test_sanitise_identifier_replaces_punctuation() {
    assert_eq!(sanitise_identifier("My-App.v2"), "my_app_v2");
}

#[test]
fn test_schema_username_fits_vendor_limit() {
    assert_eq!(schema_username("my-app", "portdb", 32), "my_app_portdb");

    let long = schema_username("a-very-long-entando-application-name", "portdb", 30);
    assert_eq!(long.len(), 30);
    // Two different long names must not collide after truncation.
    let other = schema_username("a-very-long-entando-application-name", "servdb", 30);
    assert_ne!(long, other);
}

// ── Credentials ──────────────────────────────────────────────────────────────

#[test]
fn test_generated_passwords_are_random_hex() {
    let a = generate_password();
    let b = generate_password();
    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
}

#[test]
fn test_sha256_hex_known_value() {
    assert_eq!(
        sha256_hex("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

// ── Quantities ───────────────────────────────────────────────────────────────

#[test]
fn test_memory_request_is_a_tenth_of_the_limit() {
    assert_eq!(apply_ratio("768Mi", 0.1).as_deref(), Some("76.8Mi"));
}

#[test]
fn test_ratio_truncates_to_three_decimals() {
    assert_eq!(apply_ratio("1Gi", 0.33333).as_deref(), Some("0.333Gi"));
    assert_eq!(apply_ratio("1500m", 0.1).as_deref(), Some("150m"));
}

#[test]
fn test_ratio_without_number_is_none() {
    assert_eq!(apply_ratio("Mi", 0.1), None);
}
