//! Controller flows against the in-memory facades: capability resolution,
//! qualifier ordering, post-deploy grants and phase bookkeeping.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use entando_k8s_operator::config::OperatorConfig;
use entando_k8s_operator::controller::capabilities::{
    database_service_connection, resolve_database, resolve_keycloak,
};
use entando_k8s_operator::controller::database_service::deploy_database_service;
use entando_k8s_operator::controller::entando_app::deploy_app;
use entando_k8s_operator::controller::keycloak_server::deploy_keycloak_server;
use entando_k8s_operator::controller::{failure_backoff, reconcile_status};
use entando_k8s_operator::crd::entando_app::EntandoApp;
use entando_k8s_operator::crd::entando_database_service::EntandoDatabaseService;
use entando_k8s_operator::crd::entando_keycloak_server::EntandoKeycloakServer;
use entando_k8s_operator::crd::shared::{DbmsVendor, KeycloakToUse};
use entando_k8s_operator::crd::status::{
    EntandoCustomResourceStatus, EntandoDeploymentPhase, ServerStatus, ServerStatusType,
};
use entando_k8s_operator::crd::EntandoCustomResource;
use entando_k8s_operator::error::Error;
use entando_k8s_operator::images::ImageResolver;

use common::{credentials, fakes, fast_config, meta, NS};

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn app(spec: serde_json::Value) -> EntandoApp {
    let mut app = EntandoApp::new("my-app", serde_json::from_value(spec).unwrap());
    app.metadata = meta("my-app", NS);
    app
}

fn keycloak_server(name: &str, ns: &str, default: bool, deployed: bool) -> EntandoKeycloakServer {
    let mut server = EntandoKeycloakServer::new(
        name,
        serde_json::from_value(json!({ "default": default, "ingressHostName": "sso.example.com" }))
            .unwrap(),
    );
    server.metadata = meta(name, ns);
    if deployed {
        let mut status = EntandoCustomResourceStatus::default();
        let mut server_status = ServerStatus::new("server", ServerStatusType::WebServerStatus);
        server_status.external_base_url = Some("https://sso.example.com/auth".to_string());
        server_status.admin_secret_name = Some(format!("{name}-admin-secret"));
        status.put_server_status(server_status);
        status.phase = Some(EntandoDeploymentPhase::Successful);
        server.status = Some(status);
    }
    server
}

fn database_service(name: &str, spec: serde_json::Value) -> EntandoDatabaseService {
    let mut dbs = EntandoDatabaseService::new(name, serde_json::from_value(spec).unwrap());
    dbs.metadata = meta(name, NS);
    dbs
}

fn deployed_database_service(name: &str, spec: serde_json::Value) -> EntandoDatabaseService {
    let mut dbs = database_service(name, spec);
    dbs.status = Some(EntandoCustomResourceStatus {
        phase: Some(EntandoDeploymentPhase::Successful),
        ..Default::default()
    });
    dbs
}

// ── EntandoApp ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_app_deploys_server_then_app_builder_then_component_manager() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        s.keycloak_servers.push(keycloak_server("sso", "sso-ns", true, true));
        s.secrets.insert(
            ("sso-ns".to_string(), "sso-admin-secret".to_string()),
            credentials("sso-admin-secret", "sso-ns", "admin", "s3cret"),
        );
    });

    deploy_app(&f.operator, &app(json!({}))).await.expect("app deploys");

    let server = f.k8s.position("apply_deployment:my-app-server-deployment").unwrap();
    let ab = f.k8s.position("apply_deployment:my-app-ab-deployment").unwrap();
    let cm = f.k8s.position("apply_deployment:my-app-cm-deployment").unwrap();
    assert!(server < ab && ab < cm, "{:?}", f.k8s.calls());
    assert!(f.k8s.position("apply_service:my-app-cm-service").is_some());
    assert!(f.k8s.position("apply_service_account:entando-deployer").is_some());

    // Logged in through the in-cluster URL with the admin secret.
    let logins = f.keycloak.logins.lock().unwrap().clone();
    assert_eq!(
        logins,
        vec!["admin@http://sso-server-service.sso-ns.svc.cluster.local:8080/auth".to_string()]
    );

    let calls = f.keycloak.client.calls();
    assert!(calls.contains(&"prepare_client:entando/my-app-server".to_string()));
    assert!(calls.contains(&"prepare_client:entando/my-app-de".to_string()));
    assert_eq!(
        calls.last().map(String::as_str),
        Some("assign_role:entando/my-app-de:my-app-server/superuser")
    );

    let status = f.k8s.status_of(NS, "my-app");
    for qualifier in ["server", "ab", "cm"] {
        let s = status.server_status(qualifier).unwrap();
        assert!(s.is_finished() && !s.has_failed(), "{qualifier}: {s:?}");
    }
    // Community mode keeps the app on its embedded database.
    assert!(f.k8s.position("create_job:").is_none());
}

#[tokio::test]
async fn test_app_without_any_keycloak_is_a_configuration_error() {
    let f = fakes(fast_config());

    let err = deploy_app(&f.operator, &app(json!({}))).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
    assert!(f.k8s.position("apply_deployment:").is_none());
}

#[tokio::test]
async fn test_app_on_a_database_server_without_keycloak_fails_before_any_write() {
    let f = fakes(fast_config());

    let err = deploy_app(&f.operator, &app(json!({ "dbms": "postgresql" })))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
    assert!(f.k8s.calls().is_empty(), "{:?}", f.k8s.calls());
}

#[tokio::test]
async fn test_app_without_a_host_fails_before_its_database_is_deployed() {
    let f = fakes(OperatorConfig {
        default_routing_suffix: None,
        ..fast_config()
    });
    f.k8s.with(|s| {
        s.keycloak_servers.push(keycloak_server("sso", NS, true, true));
        s.secrets.insert(
            (NS.to_string(), "sso-admin-secret".to_string()),
            credentials("sso-admin-secret", NS, "admin", "s3cret"),
        );
    });

    let err = deploy_app(&f.operator, &app(json!({ "dbms": "mysql" })))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no ingressHostName"), "got {err}");
    assert!(f.k8s.calls().is_empty(), "{:?}", f.k8s.calls());
}

#[tokio::test]
async fn test_failed_role_assignment_fails_the_app() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        s.keycloak_servers.push(keycloak_server("sso", NS, true, true));
        s.secrets.insert(
            (NS.to_string(), "sso-admin-secret".to_string()),
            credentials("sso-admin-secret", NS, "admin", "s3cret"),
        );
    });
    *f.keycloak.client.fail_role_assignment.lock().unwrap() = true;
    let app = app(json!({}));
    let target = app.reference();

    let result = reconcile_status(
        f.operator.k8s.as_ref(),
        &target,
        "server",
        deploy_app(&f.operator, &app),
    )
    .await;
    assert!(result.is_err());

    let status = f.k8s.status_of(NS, "my-app");
    assert_eq!(status.phase, Some(EntandoDeploymentPhase::Failed));
    assert_eq!(status.observed_generation, Some(1));
    let failure = status
        .server_status("server")
        .and_then(|s| s.entando_controller_failure.clone())
        .expect("failure recorded on the main qualifier");
    assert_eq!(failure.failed_object_kind.as_deref(), Some("KeycloakClient"));
    assert_eq!(failure.failed_object_name.as_deref(), Some("my-app-de"));
}

// ── Capabilities ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_named_keycloak_wins_over_the_default_one() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        s.keycloak_servers.push(keycloak_server("default-sso", NS, true, true));
        s.keycloak_servers.push(keycloak_server("team-sso", "team", false, true));
    });
    let to_use = KeycloakToUse {
        name: Some("team-sso".to_string()),
        namespace: Some("team".to_string()),
        realm: Some("team-realm".to_string()),
        public_client_id: None,
    };

    let resolved = resolve_keycloak(&f.operator, NS, Some(&to_use)).await.unwrap();
    assert_eq!(resolved.admin_secret_namespace, "team");
    assert_eq!(resolved.admin_secret_name, "team-sso-admin-secret");
    assert_eq!(resolved.connection.realm, "team-realm");
    assert_eq!(resolved.connection.public_client_id, "entando-web");
    assert_eq!(resolved.connection.base_url, "https://sso.example.com/auth");
}

#[tokio::test]
async fn test_keycloak_that_was_never_deployed_is_rejected() {
    let f = fakes(fast_config());
    f.k8s
        .with(|s| s.keycloak_servers.push(keycloak_server("sso", NS, true, false)));

    let err = resolve_keycloak(&f.operator, NS, None).await.unwrap_err();
    assert!(err.to_string().contains("has not been deployed yet"), "got {err}");
}

#[tokio::test]
async fn test_database_service_of_the_same_vendor_is_reused() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        s.database_services.push(deployed_database_service(
            "shared-db",
            json!({ "dbms": "postgresql", "createDeployment": true }),
        ))
    });
    let images = ImageResolver::new(&f.operator.config, &Default::default());
    let owner = app(json!({})).reference();

    let info = resolve_database(&f.operator, &owner, DbmsVendor::Postgresql, None, &images)
        .await
        .unwrap();
    assert_eq!(
        info.internal_service_hostname,
        "shared-db-db-service.my-namespace.svc.cluster.local"
    );
    assert_eq!(info.port, 5432);
    assert_eq!(info.admin_secret_name, "shared-db-db-admin-secret");
    assert!(f.k8s.position("apply_deployment:").is_none());
}

#[tokio::test]
async fn test_database_service_still_deploying_is_not_used() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        let mut dbs = database_service(
            "shared-db",
            json!({ "dbms": "postgresql", "createDeployment": true }),
        );
        dbs.status = Some(EntandoCustomResourceStatus {
            phase: Some(EntandoDeploymentPhase::Started),
            ..Default::default()
        });
        s.database_services.push(dbs);
    });
    let images = ImageResolver::new(&f.operator.config, &Default::default());
    let owner = app(json!({})).reference();

    let err = resolve_database(&f.operator, &owner, DbmsVendor::Postgresql, None, &images)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
    assert!(err.to_string().contains("shared-db"), "got {err}");
    assert!(err.to_string().contains("started"), "got {err}");
    assert!(f.k8s.calls().is_empty(), "{:?}", f.k8s.calls());
}

#[tokio::test]
async fn test_ready_database_service_wins_over_a_failed_one() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        let mut failed = database_service("broken-db", json!({ "dbms": "mysql", "createDeployment": true }));
        failed.status = Some(EntandoCustomResourceStatus {
            phase: Some(EntandoDeploymentPhase::Failed),
            ..Default::default()
        });
        s.database_services.push(failed);
        s.database_services.push(deployed_database_service(
            "good-db",
            json!({ "dbms": "mysql", "createDeployment": true }),
        ));
    });
    let images = ImageResolver::new(&f.operator.config, &Default::default());
    let owner = app(json!({})).reference();

    let info = resolve_database(&f.operator, &owner, DbmsVendor::Mysql, None, &images)
        .await
        .unwrap();
    assert_eq!(info.admin_secret_name, "good-db-db-admin-secret");
}

#[tokio::test]
async fn test_missing_database_service_deploys_a_dedicated_one() {
    let f = fakes(fast_config());
    let images = ImageResolver::new(&f.operator.config, &Default::default());
    let owner = app(json!({})).reference();

    let info = resolve_database(&f.operator, &owner, DbmsVendor::Mysql, None, &images)
        .await
        .unwrap();
    assert_eq!(info.vendor, DbmsVendor::Mysql);
    assert_eq!(info.admin_secret_name, "my-app-db-admin-secret");
    assert!(f.k8s.position("apply_deployment:my-app-db-deployment").is_some());
    assert!(f.k8s.position("create_secret:my-app-db-admin-secret").is_some());
}

#[test]
fn test_external_database_service_connection_uses_its_secret() {
    let dbs = database_service(
        "oracle-db",
        json!({
            "dbms": "oracle",
            "host": "oracle.example.com",
            "port": 1522,
            "databaseName": "ORCL",
            "secretName": "oracle-admin",
            "tablespace": "USERS",
        }),
    );
    let info = database_service_connection(&dbs).unwrap();
    assert_eq!(info.port, 1522);
    assert_eq!(info.database_name, "ORCL");
    assert_eq!(info.admin_secret_name, "oracle-admin");
    assert_eq!(info.tablespace.as_deref(), Some("USERS"));
}

// ── EntandoDatabaseService ───────────────────────────────────────────────────

#[tokio::test]
async fn test_external_database_without_host_fails_before_any_mutation() {
    let f = fakes(fast_config());
    let dbs = database_service("ext-db", json!({ "dbms": "postgresql", "secretName": "ext-admin" }));

    let err = deploy_database_service(&f.operator, &dbs).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("spec.host"));
    assert!(f.k8s.calls().is_empty());
}

#[tokio::test]
async fn test_external_database_with_missing_secret_is_a_configuration_error() {
    let f = fakes(fast_config());
    let dbs = database_service(
        "ext-db",
        json!({ "dbms": "postgresql", "host": "pg.example.com", "secretName": "ext-admin" }),
    );

    let err = deploy_database_service(&f.operator, &dbs).await.unwrap_err();
    assert!(err.to_string().contains("ext-admin"), "got {err}");
    assert!(f.k8s.calls().is_empty());
}

#[tokio::test]
async fn test_external_database_is_exposed_as_an_external_name_service() {
    let f = fakes(fast_config());
    f.k8s.with(|s| {
        s.secrets.insert(
            (NS.to_string(), "ext-admin".to_string()),
            credentials("ext-admin", NS, "postgres", "pw"),
        )
    });
    let dbs = database_service(
        "ext-db",
        json!({ "dbms": "postgresql", "host": "pg.example.com", "secretName": "ext-admin" }),
    );

    deploy_database_service(&f.operator, &dbs).await.unwrap();

    let svc = f
        .k8s
        .with(|s| s.services.get(&(NS.to_string(), "ext-db-db-service".to_string())).cloned())
        .unwrap();
    let spec = svc.spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
    assert_eq!(spec.external_name.as_deref(), Some("pg.example.com"));
    assert_eq!(spec.ports.unwrap()[0].port, 5432);

    let status = f.k8s.status_of(NS, "ext-db");
    let db = status.server_status("db").unwrap();
    assert!(db.is_finished());
    assert_eq!(db.service_name.as_deref(), Some("ext-db-db-service"));
}

// ── EntandoKeycloakServer ────────────────────────────────────────────────────

#[tokio::test]
async fn test_keycloak_server_ensures_realm_and_public_client() {
    let f = fakes(fast_config());
    let server = keycloak_server("sso", NS, true, false);

    deploy_keycloak_server(&f.operator, &server).await.unwrap();

    assert!(f.k8s.position("create_secret:sso-admin-secret") < f.k8s.position("apply_deployment:"));
    let calls = f.keycloak.client.calls();
    assert_eq!(
        calls,
        vec![
            "ensure_realm:entando".to_string(),
            "create_public_client:entando/entando-web".to_string(),
        ]
    );
    let status = f.k8s.status_of(NS, "sso");
    let server_status = status.server_status("server").unwrap();
    assert_eq!(server_status.admin_secret_name.as_deref(), Some("sso-admin-secret"));
    assert_eq!(
        server_status.external_base_url.as_deref(),
        Some("http://sso.example.com/auth")
    );
}

#[tokio::test]
async fn test_keycloak_server_without_a_host_fails_before_its_database_is_deployed() {
    let f = fakes(OperatorConfig {
        default_routing_suffix: None,
        ..fast_config()
    });
    let mut server = EntandoKeycloakServer::new(
        "sso",
        serde_json::from_value(json!({ "dbms": "postgresql" })).unwrap(),
    );
    server.metadata = meta("sso", NS);

    let err = deploy_keycloak_server(&f.operator, &server).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
    assert!(f.k8s.calls().is_empty(), "{:?}", f.k8s.calls());
}

// ── Phase bookkeeping ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_pass_records_the_observed_generation() {
    let f = fakes(fast_config());
    let target = app(json!({})).reference();

    let phase = reconcile_status(f.operator.k8s.as_ref(), &target, "server", async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(phase, EntandoDeploymentPhase::Successful);
    let status = f.k8s.status_of(NS, "my-app");
    assert_eq!(status.phase, Some(EntandoDeploymentPhase::Successful));
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(
        f.k8s.calls(),
        vec!["update_phase:started".to_string(), "update_phase:successful".to_string()]
    );
}

#[tokio::test]
async fn test_failures_from_earlier_passes_do_not_fail_a_new_pass() {
    let f = fakes(fast_config());
    let target = app(json!({})).reference();
    f.k8s.with(|s| {
        let mut old = ServerStatus::new("ab", ServerStatusType::WebServerStatus);
        old.started = Some(Utc::now() - ChronoDuration::hours(1));
        old.entando_controller_failure = Some(Default::default());
        s.statuses
            .entry((NS.to_string(), "my-app".to_string()))
            .or_default()
            .put_server_status(old);
    });

    let phase = reconcile_status(f.operator.k8s.as_ref(), &target, "server", async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(phase, EntandoDeploymentPhase::Successful);
}

#[test]
fn test_recent_failure_of_current_generation_backs_off() {
    let mut app = app(json!({}));
    let mut status = EntandoCustomResourceStatus {
        observed_generation: Some(1),
        phase: Some(EntandoDeploymentPhase::Failed),
        ..Default::default()
    };
    let mut server = ServerStatus::started_now("server", ServerStatusType::WebServerStatus);
    server.finish();
    status.put_server_status(server);
    app.status = Some(status);
    assert!(failure_backoff(&app).is_some());

    // A new generation is deployed straight away.
    app.metadata.generation = Some(2);
    assert!(failure_backoff(&app).is_none());
}

#[test]
fn test_up_to_date_only_when_current_generation_succeeded() {
    let mut app = app(json!({}));
    assert!(!app.is_up_to_date());
    app.status = Some(EntandoCustomResourceStatus {
        observed_generation: Some(1),
        phase: Some(EntandoDeploymentPhase::Successful),
        ..Default::default()
    });
    assert!(app.is_up_to_date());
    app.metadata.generation = Some(2);
    assert!(!app.is_up_to_date());
}
