//! SSO admin facade.
//!
//! Deployables that sit behind the Ingress register OIDC clients with the
//! Keycloak server they authenticate against. The deployment core only sees the
//! [`KeycloakClient`] trait; [`HttpKeycloakClient`] drives the Keycloak admin
//! REST API with reqwest.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Realm every Entando component registers its clients in.
pub const ENTANDO_REALM: &str = "entando";
/// Public client used by browser front ends.
pub const ENTANDO_PUBLIC_CLIENT: &str = "entando-web";

/// A client role granted to another client's service account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permission {
    pub client_id: String,
    pub role: String,
}

impl Permission {
    pub fn new(client_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            role: role.into(),
        }
    }
}

/// A client role a registered client exposes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedRole {
    pub code: String,
    pub name: String,
}

impl ExpectedRole {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// Desired state of a confidential OIDC client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeycloakClientConfig {
    pub realm: String,
    pub client_id: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub web_origins: Vec<String>,
    pub roles: Vec<ExpectedRole>,
    pub permissions: Vec<Permission>,
}

impl KeycloakClientConfig {
    pub fn new(realm: impl Into<String>, client_id: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            client_id: client_id.into(),
            client_name: client_name.into(),
            ..Default::default()
        }
    }

    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uris.push(uri.into());
        self
    }

    pub fn with_web_origin(mut self, origin: impl Into<String>) -> Self {
        self.web_origins.push(origin.into());
        self
    }

    pub fn with_role(mut self, role: ExpectedRole) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }
}

/// Admin operations on a logged-in Keycloak server.
#[async_trait]
pub trait KeycloakClient: Send + Sync {
    async fn ensure_realm(&self, realm: &str) -> Result<()>;

    /// Create the public browser client for `domain` unless it exists.
    async fn create_public_client(&self, realm: &str, client_id: &str, domain: &str) -> Result<()>;

    /// Create or update a confidential client and return its secret.
    async fn prepare_client_and_return_secret(&self, config: &KeycloakClientConfig) -> Result<String>;

    async fn update_client(&self, config: &KeycloakClientConfig) -> Result<()>;

    /// Grant `permission` to the service account of `client_id`.
    async fn assign_role_to_client_service_account(
        &self,
        realm: &str,
        client_id: &str,
        permission: &Permission,
    ) -> Result<()>;
}

/// Produces logged-in [`KeycloakClient`]s.
#[async_trait]
pub trait KeycloakConnector: Send + Sync {
    async fn login(&self, base_url: &str, username: &str, password: &str) -> Result<Arc<dyn KeycloakClient>>;
}

// ── reqwest implementation ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    60
}

/// Connector for [`HttpKeycloakClient`].
#[derive(Clone, Default)]
pub struct HttpKeycloakConnector {
    http: reqwest::Client,
}

impl HttpKeycloakConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl KeycloakConnector for HttpKeycloakConnector {
    async fn login(&self, base_url: &str, username: &str, password: &str) -> Result<Arc<dyn KeycloakClient>> {
        let client = HttpKeycloakClient::login(self.http.clone(), base_url, username, password).await?;
        Ok(Arc::new(client))
    }
}

/// Keycloak admin REST client. Admin tokens are short-lived, so the token is
/// refreshed with the stored credentials whenever it is about to expire.
pub struct HttpKeycloakClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl HttpKeycloakClient {
    /// Log in against the master realm. Fails eagerly on bad credentials.
    pub async fn login(http: reqwest::Client, base_url: &str, username: &str, password: &str) -> Result<Self> {
        let client = Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: Mutex::new(None),
        };
        client.token().await?;
        info!(base_url = %client.base_url, "logged in to Keycloak");
        Ok(client)
    }

    async fn fetch_token(&self) -> Result<TokenResponse> {
        let url = format!("{}/realms/master/protocol/openid-connect/token", self.base_url);
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::keycloak(format!(
                "login to {} failed with status {}",
                self.base_url,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn token(&self) -> Result<String> {
        if let Ok(guard) = self.token.lock() {
            if let Some((token, expiry)) = guard.as_ref() {
                if Instant::now() < *expiry {
                    return Ok(token.clone());
                }
            }
        }
        let fresh = self.fetch_token().await?;
        // Refresh a little before the server expires the token.
        let lifetime = Duration::from_secs(fresh.expires_in.saturating_sub(10).max(1));
        if let Ok(mut guard) = self.token.lock() {
            *guard = Some((fresh.access_token.clone(), Instant::now() + lifetime));
        }
        Ok(fresh.access_token)
    }

    /// Send an admin API request. Returns `None` on 404.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let url = format!("{}/admin/realms{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(self.token().await?)
            .timeout(Duration::from_secs(30));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        debug!(%method, %url, %status, "keycloak admin call");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::keycloak(format!("{method} {url} returned {status}: {text}")));
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.send(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::POST, path, Some(body))
            .await?
            .ok_or_else(|| Error::keycloak(format!("POST {path} returned 404")))?;
        Ok(())
    }

    async fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::PUT, path, Some(body))
            .await?
            .ok_or_else(|| Error::keycloak(format!("PUT {path} returned 404")))?;
        Ok(())
    }

    /// Internal id of a client looked up by its clientId.
    async fn find_client(&self, realm: &str, client_id: &str) -> Result<Option<String>> {
        let found = self
            .get(&format!("/{realm}/clients?clientId={client_id}"))
            .await?
            .unwrap_or(Value::Null);
        Ok(found
            .as_array()
            .and_then(|clients| clients.first())
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn require_client(&self, realm: &str, client_id: &str) -> Result<String> {
        self.find_client(realm, client_id)
            .await?
            .ok_or_else(|| Error::keycloak(format!("client {client_id} not found in realm {realm}")))
    }

    fn confidential_representation(config: &KeycloakClientConfig) -> Value {
        json!({
            "clientId": config.client_id,
            "name": config.client_name,
            "enabled": true,
            "publicClient": false,
            "serviceAccountsEnabled": true,
            "standardFlowEnabled": true,
            "directAccessGrantsEnabled": true,
            "redirectUris": config.redirect_uris,
            "webOrigins": config.web_origins,
        })
    }

    async fn ensure_roles(&self, realm: &str, internal_id: &str, roles: &[ExpectedRole]) -> Result<()> {
        for role in roles {
            let path = format!("/{realm}/clients/{internal_id}/roles/{}", role.code);
            if self.get(&path).await?.is_none() {
                self.post(
                    &format!("/{realm}/clients/{internal_id}/roles"),
                    &json!({ "name": role.code, "description": role.name }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn apply_permissions(&self, config: &KeycloakClientConfig) -> Result<()> {
        for permission in &config.permissions {
            self.assign_role_to_client_service_account(&config.realm, &config.client_id, permission)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeycloakClient for HttpKeycloakClient {
    async fn ensure_realm(&self, realm: &str) -> Result<()> {
        if self.get(&format!("/{realm}")).await?.is_none() {
            info!(%realm, "creating realm");
            self.send(
                Method::POST,
                "",
                Some(&json!({ "realm": realm, "enabled": true })),
            )
            .await?;
        }
        Ok(())
    }

    async fn create_public_client(&self, realm: &str, client_id: &str, domain: &str) -> Result<()> {
        if self.find_client(realm, client_id).await?.is_some() {
            return Ok(());
        }
        info!(%realm, %client_id, %domain, "creating public client");
        self.post(
            &format!("/{realm}/clients"),
            &json!({
                "clientId": client_id,
                "enabled": true,
                "publicClient": true,
                "redirectUris": [format!("{domain}/*")],
                "webOrigins": [domain],
            }),
        )
        .await
    }

    async fn prepare_client_and_return_secret(&self, config: &KeycloakClientConfig) -> Result<String> {
        self.ensure_realm(&config.realm).await?;
        let internal_id = match self.find_client(&config.realm, &config.client_id).await? {
            Some(id) => {
                self.put(
                    &format!("/{}/clients/{id}", config.realm),
                    &Self::confidential_representation(config),
                )
                .await?;
                id
            }
            None => {
                info!(realm = %config.realm, client_id = %config.client_id, "creating client");
                self.post(
                    &format!("/{}/clients", config.realm),
                    &Self::confidential_representation(config),
                )
                .await?;
                self.require_client(&config.realm, &config.client_id).await?
            }
        };
        self.ensure_roles(&config.realm, &internal_id, &config.roles)
            .await?;
        self.apply_permissions(config).await?;
        let secret = self
            .get(&format!("/{}/clients/{internal_id}/client-secret", config.realm))
            .await?
            .unwrap_or(Value::Null);
        secret
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::keycloak(format!("client {} has no secret", config.client_id)))
    }

    async fn update_client(&self, config: &KeycloakClientConfig) -> Result<()> {
        let internal_id = self.require_client(&config.realm, &config.client_id).await?;
        self.put(
            &format!("/{}/clients/{internal_id}", config.realm),
            &Self::confidential_representation(config),
        )
        .await?;
        self.ensure_roles(&config.realm, &internal_id, &config.roles)
            .await?;
        self.apply_permissions(config).await
    }

    async fn assign_role_to_client_service_account(
        &self,
        realm: &str,
        client_id: &str,
        permission: &Permission,
    ) -> Result<()> {
        let internal_id = self.require_client(realm, client_id).await?;
        let user = self
            .get(&format!("/{realm}/clients/{internal_id}/service-account-user"))
            .await?
            .unwrap_or(Value::Null);
        let user_id = user
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::keycloak(format!("client {client_id} has no service account")))?;
        let role_client = self.require_client(realm, &permission.client_id).await?;
        let role = self
            .get(&format!("/{realm}/clients/{role_client}/roles/{}", permission.role))
            .await?
            .ok_or_else(|| {
                Error::keycloak(format!(
                    "role {} not found on client {}",
                    permission.role, permission.client_id
                ))
            })?;
        self.post(
            &format!("/{realm}/users/{user_id}/role-mappings/clients/{role_client}"),
            &json!([role]),
        )
        .await
    }
}
