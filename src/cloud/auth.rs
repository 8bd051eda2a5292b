use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CloudConfig;

pub const TOKEN_KEY: &str = "google_auth_token";

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("not signed in")]
    NotAuthenticated,
    #[error("token endpoint rejected the request: {0}")]
    Rejected(String),
    #[error("authorization cancelled")]
    Cancelled,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),
    #[error("missing oauth setting: {0}")]
    Misconfigured(&'static str),
    #[error("secret store error: {0}")]
    Store(String),
}

impl AuthError {
    /// Credentials are missing or refused, as opposed to the network failing.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::NotAuthenticated | Self::Rejected(_) | Self::StateMismatch
        )
    }
}

/// Stored token, in the shape persisted under [`TOKEN_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<String>,
}

impl OAuthToken {
    /// Expired or expiring within five minutes.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + chrono::Duration::minutes(5)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: i64,
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<String>) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .or(previous_refresh),
            token_type: self.token_type,
            expires_in: self.expires_in,
            expires_at: Utc::now() + chrono::Duration::seconds(self.expires_in),
            scope: self.scope,
        }
    }
}

/// Platform secure storage, reduced to string values under string keys.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    fn remove(&self, key: &str);
}

/// One owner-readable file per key.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| AuthError::Store(e.to_string()))?;
        let path = self.path(key);
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .map_err(|e| AuthError::Store(e.to_string()))?;

        // an older file keeps its mode on open, so narrow it before writing
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| AuthError::Store(e.to_string()))?;
        }

        file.write_all(value.as_bytes())
            .map_err(|e| AuthError::Store(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Err(e) = std::fs::remove_file(self.path(key))
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %e, "failed to remove stored secret");
        }
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.values
            .lock()
            .map_err(|e| AuthError::Store(e.to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
    }
}

/// The interactive half of the authorization-code flow: show the user
/// `url` and hand back the full redirect URL the provider sent them to.
pub trait AuthorizationPrompt: Send + Sync {
    fn authorize<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>>;
}

/// Source of bearer tokens for the Drive client.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> BoxFuture<'_, Result<String, AuthError>>;

    fn is_authenticated(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.access_token().await.is_ok() })
    }
}

/// A fixed token, for tools and tests that already hold one.
pub struct StaticToken(pub String);

impl AccessTokenProvider for StaticToken {
    fn access_token(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }
}

impl OAuthEndpoints {
    /// All three endpoints under one base URL (for testing)
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            auth_url: format!("{}/o/oauth2/v2/auth", base),
            token_url: format!("{}/token", base),
            revoke_url: format!("{}/revoke", base),
        }
    }
}

pub struct GoogleAuth {
    client: Client,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    scopes: Vec<String>,
    endpoints: OAuthEndpoints,
    store: Arc<dyn SecretStore>,
    token: tokio::sync::Mutex<Option<OAuthToken>>,
}

impl GoogleAuth {
    pub fn new(config: &CloudConfig, store: Arc<dyn SecretStore>) -> Result<Self, AuthError> {
        Self::with_endpoints(config, store, OAuthEndpoints::default())
    }

    pub fn with_endpoints(
        config: &CloudConfig,
        store: Arc<dyn SecretStore>,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::Misconfigured("cloud.client_id"))?;

        Ok(Self {
            client: Client::new(),
            client_id,
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            endpoints,
            store,
            token: tokio::sync::Mutex::new(None),
        })
    }

    pub fn authorization_url(&self, state: &str) -> String {
        let scope = self.scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];

        match url::Url::parse_with_params(&self.endpoints.auth_url, params) {
            Ok(url) => url.to_string(),
            Err(_) => format!(
                "{}?{}",
                self.endpoints.auth_url,
                params
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                    .collect::<Vec<_>>()
                    .join("&")
            ),
        }
    }

    /// Unguessable value echoed back through the redirect.
    pub fn new_state() -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seed = format!("{}:{}", nanos, std::process::id());
        sha1_smol::Sha1::from(seed).digest().to_string()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<OAuthToken, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let token = self.request_token(&form, None).await?;
        self.persist(&token)?;
        *self.token.lock().await = Some(token.clone());
        info!("signed in");
        Ok(token)
    }

    /// New access token from a refresh token. The refresh token is kept when
    /// the provider does not rotate it.
    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthToken, AuthError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let token = self
            .request_token(&form, Some(refresh_token.to_string()))
            .await?;
        self.persist(&token)?;
        debug!(expires_at = %token.expires_at, "access token refreshed");
        Ok(token)
    }

    async fn request_token(
        &self,
        form: &[(&str, &str)],
        previous_refresh: Option<String>,
    ) -> Result<OAuthToken, AuthError> {
        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!("status {}: {}", status, body)));
        }

        let body: TokenResponse = response.json().await?;
        Ok(body.into_token(previous_refresh))
    }

    fn persist(&self, token: &OAuthToken) -> Result<(), AuthError> {
        let json = serde_json::to_string(token).map_err(|e| AuthError::Store(e.to_string()))?;
        self.store.set(TOKEN_KEY, &json)
    }

    fn stored_token(&self) -> Option<OAuthToken> {
        let json = self.store.get(TOKEN_KEY)?;
        match serde_json::from_str(&json) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "stored token unreadable");
                None
            }
        }
    }

    /// Stored token if any, without touching the network.
    pub async fn current_token(&self) -> Option<OAuthToken> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            *guard = self.stored_token();
        }
        guard.clone()
    }

    /// A usable access token, refreshing it first when close to expiry.
    pub async fn valid_token(&self) -> Result<String, AuthError> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            *guard = self.stored_token();
        }

        let token = guard.as_ref().ok_or(AuthError::NotAuthenticated)?;
        if !token.needs_refresh(Utc::now()) {
            return Ok(token.access_token.clone());
        }

        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or(AuthError::NotAuthenticated)?;
        let refreshed = self.refresh(&refresh_token).await?;
        let access = refreshed.access_token.clone();
        *guard = Some(refreshed);
        Ok(access)
    }

    /// Signed in already, or run the interactive flow through `prompt`.
    pub async fn initialize(&self, prompt: &dyn AuthorizationPrompt) -> Result<(), AuthError> {
        match self.valid_token().await {
            Ok(_) => return Ok(()),
            Err(e) if !e.is_auth_failure() => return Err(e),
            Err(_) => {}
        }

        let state = Self::new_state();
        let url = self.authorization_url(&state);
        let redirect = prompt.authorize(&url).await.ok_or(AuthError::Cancelled)?;
        let code = parse_redirect(&redirect, &state)?;
        self.exchange_code(&code).await?;
        Ok(())
    }

    /// Revoke server-side (best effort) and forget the local token.
    pub async fn sign_out(&self) {
        let token = self.current_token().await;

        if let Some(token) = token {
            let revoke = token.refresh_token.as_deref().unwrap_or(&token.access_token);
            match self
                .client
                .post(&self.endpoints.revoke_url)
                .form(&[("token", revoke)])
                .send()
                .await
            {
                Ok(r) if r.status().is_success() => debug!("token revoked"),
                Ok(r) => warn!(status = %r.status(), "token revoke refused"),
                Err(e) => warn!(error = %e, "token revoke failed"),
            }
        }

        self.store.remove(TOKEN_KEY);
        *self.token.lock().await = None;
        info!("signed out");
    }
}

impl AccessTokenProvider for GoogleAuth {
    fn access_token(&self) -> BoxFuture<'_, Result<String, AuthError>> {
        Box::pin(self.valid_token())
    }
}

/// Pull the authorization code out of the redirect URL, checking `state`.
pub fn parse_redirect(redirect: &str, expected_state: &str) -> Result<String, AuthError> {
    let url = url::Url::parse(redirect.trim())
        .map_err(|e| AuthError::InvalidRedirect(e.to_string()))?;

    let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
    if let Some(error) = params.get("error") {
        return Err(AuthError::Rejected(error.clone()));
    }
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(AuthError::StateMismatch);
    }
    params
        .get("code")
        .cloned()
        .ok_or_else(|| AuthError::InvalidRedirect("no code parameter".to_string()))
}
