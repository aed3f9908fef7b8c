//! OAuth credential store for the Workspace APIs
//!
//! Handles the OAuth 2.0 token lifecycle:
//! - Loading the persisted token record
//! - Refreshing expired access tokens
//! - Interactive browser-based authorization as a last resort
//!
//! The in-memory credential sits behind an async mutex that is held for the
//! whole load/refresh/authorize sequence, so concurrent callers never start a
//! second flow; they wait and then see the credential the first one produced.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::workspace::service::{base_url, ServiceHandle};

/// Access tokens this close to expiry are treated as expired
const EXPIRY_SKEW_SECS: i64 = 60;

/// How long the loopback listener waits for the browser redirect
const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Client id and secret from the Cloud Console download
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthKeys {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Desktop clients download `{"installed": ...}`, web clients `{"web": ...}`
#[derive(Deserialize)]
struct ClientSecretsFile {
    #[serde(alias = "web")]
    installed: Option<OAuthKeys>,
}

impl OAuthKeys {
    /// Load client credentials downloaded from Google Cloud Console
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::KeysFileNotFound {
                    path: path.display().to_string(),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str::<ClientSecretsFile>(&content)
            .ok()
            .and_then(|file| file.installed)
            .ok_or_else(|| AuthError::InvalidKeysFormat.into())
    }
}

/// The token record kept in `token.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "bearer")]
    pub token_type: String,
    /// Unix seconds; `None` means the token does not expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn bearer() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Usable at `now` without a refresh
    pub fn is_valid_at(&self, now: i64) -> bool {
        match self.expiry_date {
            Some(expiry) => expiry - now > EXPIRY_SKEW_SECS,
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(unix_now())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Network half of the token lifecycle
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    /// Exchange the credential's refresh token for a new access token
    async fn refresh(&self, keys: &OAuthKeys, credential: &Credential) -> Result<Credential>;

    /// Run the interactive consent flow
    async fn authorize(&self, keys: &OAuthKeys, scopes: &[String]) -> Result<Credential>;
}

/// Body of a successful token-endpoint call
#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "bearer")]
    token_type: String,
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

impl TokenGrant {
    fn into_credential(self, previous: Option<&Credential>, requested: &[String]) -> Credential {
        let scopes = if self.scope.is_empty() {
            previous
                .map(|c| c.scopes.clone())
                .unwrap_or_else(|| requested.to_vec())
        } else {
            self.scope.split_whitespace().map(str::to_string).collect()
        };

        Credential {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|c| c.refresh_token.clone())),
            token_type: self.token_type,
            expiry_date: self.expires_in.map(|e| unix_now() + e),
            scopes,
        }
    }
}

/// Google's installed-app flow over a loopback redirect
pub struct GoogleOAuthFlow {
    http_client: reqwest::Client,
    callback_port: u16,
}

impl GoogleOAuthFlow {
    pub fn new(callback_port: u16) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            callback_port,
        }
    }

    /// Generate the authorization URL
    pub fn auth_url(keys: &OAuthKeys, redirect_uri: &str, scopes: &[String]) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
            keys.auth_uri,
            urlencoding::encode(&keys.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" "))
        )
    }

    /// POST a grant to the token endpoint; `fail` builds the error for
    /// transport, status and decoding failures alike
    async fn grant(
        &self,
        keys: &OAuthKeys,
        params: &[(&str, &str)],
        fail: fn(String) -> AuthError,
    ) -> Result<TokenGrant> {
        let response = self
            .http_client
            .post(&keys.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(fail(format!("{}: {}", status, body.trim())).into());
        }
        Ok(response.json().await.map_err(|e| fail(e.to_string()))?)
    }
}

#[async_trait]
impl OAuthFlow for GoogleOAuthFlow {
    async fn refresh(&self, keys: &OAuthKeys, credential: &Credential) -> Result<Credential> {
        let refresh_token = credential.refresh_token.as_deref().ok_or_else(|| {
            AuthError::TokenRefreshFailed {
                message: "credential has no refresh token".to_string(),
            }
        })?;

        let grant = self
            .grant(
                keys,
                &[
                    ("client_id", keys.client_id.as_str()),
                    ("client_secret", keys.client_secret.as_str()),
                    ("refresh_token", refresh_token),
                    ("grant_type", "refresh_token"),
                ],
                |message| AuthError::TokenRefreshFailed { message },
            )
            .await?;
        Ok(grant.into_credential(Some(credential), &credential.scopes))
    }

    async fn authorize(&self, keys: &OAuthKeys, scopes: &[String]) -> Result<Credential> {
        use axum::{extract::Query, response::Html, routing::get, Router};
        use std::collections::HashMap;
        use std::future::IntoFuture;
        use tokio::sync::oneshot;

        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], self.callback_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://localhost:{}/oauth2callback", port);

        let auth_url = Self::auth_url(keys, &redirect_uri, scopes);
        eprintln!("\nPlease visit this URL to authorize Google Workspace access:");
        eprintln!("{}\n", auth_url);

        if let Err(e) = open::that(&auth_url) {
            warn!("Could not open browser automatically: {}", e);
            eprintln!("Please open the URL manually.");
        }

        let (tx, rx) = oneshot::channel::<std::result::Result<String, String>>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let callback_handler = move |Query(params): Query<HashMap<String, String>>| async move {
            let outcome = match (params.get("code"), params.get("error")) {
                (Some(code), _) => Ok(code.clone()),
                (None, Some(error)) => Err(error.clone()),
                (None, None) => Err("no authorization code received".to_string()),
            };
            let succeeded = outcome.is_ok();
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(outcome);
            }
            if succeeded {
                Html("<html><body><h1>Google Workspace access granted</h1><p>Return to your terminal.</p></body></html>")
            } else {
                Html("<html><body><h1>Google Workspace access was not granted</h1><p>Check the terminal for details.</p></body></html>")
            }
        };

        let app = Router::new().route("/oauth2callback", get(callback_handler));
        info!("Waiting for OAuth callback on port {}", port);

        let server = axum::serve(listener, app).into_future();

        let code = tokio::select! {
            result = server => {
                let message = match result {
                    Err(e) => e.to_string(),
                    Ok(()) => "callback server stopped".to_string(),
                };
                return Err(AuthError::CallbackError { message }.into());
            }
            _ = tokio::time::sleep(AUTHORIZATION_TIMEOUT) => {
                return Err(AuthError::CallbackError {
                    message: "timed out waiting for authorization".to_string(),
                }
                .into());
            }
            code = rx => match code {
                Ok(Ok(code)) => code,
                Ok(Err(message)) => return Err(AuthError::CallbackError { message }.into()),
                Err(_) => return Err(AuthError::NoAuthCode.into()),
            },
        };

        debug!("Received authorization code, exchanging for tokens");
        let grant = self
            .grant(
                keys,
                &[
                    ("client_id", keys.client_id.as_str()),
                    ("client_secret", keys.client_secret.as_str()),
                    ("code", code.as_str()),
                    ("grant_type", "authorization_code"),
                    ("redirect_uri", redirect_uri.as_str()),
                ],
                |message| AuthError::TokenExchangeFailed { message },
            )
            .await?;
        Ok(grant.into_credential(None, scopes))
    }
}

/// Owner of the process's OAuth credential
pub struct CredentialStore {
    config: Config,
    flow: Arc<dyn OAuthFlow>,
    http_client: reqwest::Client,
    credential: Mutex<Option<Credential>>,
}

impl CredentialStore {
    /// Store backed by Google's real OAuth endpoints
    pub fn new(config: Config) -> Self {
        let flow = Arc::new(GoogleOAuthFlow::new(config.oauth_callback_port));
        Self::with_flow(config, flow)
    }

    pub fn with_flow(config: Config, flow: Arc<dyn OAuthFlow>) -> Self {
        info!(
            "Credential store initialized with config dir: {}",
            config.config_dir.display()
        );
        Self {
            config,
            flow,
            http_client: reqwest::Client::new(),
            credential: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Authenticated handle for one Workspace API
    pub async fn get_service(self: &Arc<Self>, service: &str, version: &str) -> Result<ServiceHandle> {
        let base = base_url(service, version).ok_or_else(|| AuthError::UnknownService {
            service: service.to_string(),
            version: version.to_string(),
        })?;

        self.credential().await?;
        debug!("Built {} {} service", service, version);
        Ok(ServiceHandle::new(
            service,
            version,
            base,
            self.clone(),
            self.http_client.clone(),
        ))
    }

    /// Bearer token for one request, refreshed if necessary
    pub async fn access_token(&self) -> Result<String> {
        Ok(self.credential().await?.access_token)
    }

    /// A valid credential, loading, refreshing or authorizing as needed
    pub async fn credential(&self) -> Result<Credential> {
        let mut slot = self.credential.lock().await;
        self.ensure(&mut slot, false).await
    }

    /// Explicit authorization; `force` skips any stored credential
    pub async fn authenticate(&self, force: bool) -> Result<Credential> {
        let mut slot = self.credential.lock().await;
        self.ensure(&mut slot, force).await
    }

    /// Whether a credential is held in memory or persisted
    pub async fn is_authenticated(&self) -> bool {
        self.credential.lock().await.is_some() || self.config.token_exists()
    }

    /// Delete the persisted credential and forget the in-memory one
    pub async fn revoke(&self) -> Result<()> {
        let mut slot = self.credential.lock().await;
        match tokio::fs::remove_file(&self.config.token_path).await {
            Ok(()) => info!("Credentials revoked and deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No persisted credentials to revoke")
            }
            Err(e) => return Err(e.into()),
        }
        *slot = None;
        Ok(())
    }

    async fn ensure(&self, slot: &mut Option<Credential>, force: bool) -> Result<Credential> {
        if !force {
            if let Some(current) = slot.as_ref().filter(|c| c.is_valid()) {
                return Ok(current.clone());
            }

            let candidate = match slot.take() {
                Some(current) => Some(current),
                None => self.load().await,
            };

            if let Some(candidate) = candidate {
                if candidate.is_valid() {
                    info!("Using existing valid credentials");
                    *slot = Some(candidate.clone());
                    return Ok(candidate);
                }

                if candidate.can_refresh() {
                    match self.refresh(&candidate).await {
                        Ok(refreshed) => {
                            *slot = Some(refreshed.clone());
                            return Ok(refreshed);
                        }
                        Err(e) => warn!("Refresh failed, starting new auth flow: {}", e),
                    }
                }
            }
        }

        let keys = OAuthKeys::load(&self.config.client_secrets_path)?;
        info!("Starting OAuth authentication flow");
        let credential = self.flow.authorize(&keys, &self.config.scopes).await?;
        self.save(&credential).await?;
        info!("Authentication successful");
        *slot = Some(credential.clone());
        Ok(credential)
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        info!("Refreshing expired credentials");
        let keys = OAuthKeys::load(&self.config.client_secrets_path)?;
        let refreshed = self.flow.refresh(&keys, credential).await?;
        self.save(&refreshed).await?;
        info!("Credentials refreshed successfully");
        Ok(refreshed)
    }

    /// Persisted credential; a missing or unreadable record counts as none
    async fn load(&self) -> Option<Credential> {
        let content = match tokio::fs::read_to_string(&self.config.token_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Token file not found");
                return None;
            }
            Err(e) => {
                warn!("Failed to read credentials: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(credential) => {
                info!("Loaded credentials from token file");
                Some(credential)
            }
            Err(e) => {
                warn!("Failed to parse credentials: {}", e);
                None
            }
        }
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let persist = |e: std::io::Error| AuthError::PersistFailed {
            message: e.to_string(),
        };

        let content = serde_json::to_string_pretty(credential)?;
        if let Some(parent) = self.config.token_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist)?;
        }
        tokio::fs::write(&self.config.token_path, content)
            .await
            .map_err(persist)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.config.token_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(persist)?;
        }

        info!("Saved credentials to token file");
        Ok(())
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_keys_deserialize() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id",
                "client_secret": "test-secret",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "redirect_uris": ["http://localhost"]
            }
        }"#;

        let keys_file: ClientSecretsFile = serde_json::from_str(json).unwrap();
        assert_eq!(keys_file.installed.unwrap().client_id, "test-client-id");
    }

    #[test]
    fn test_web_keys_accepted() {
        let json = r#"{"web": {"client_id": "web-id", "client_secret": "s"}}"#;
        let keys_file: ClientSecretsFile = serde_json::from_str(json).unwrap();
        let keys = keys_file.installed.unwrap();
        assert_eq!(keys.client_id, "web-id");
        assert_eq!(keys.token_uri, "https://oauth2.googleapis.com/token");
    }

    #[test]
    fn test_credential_round_trip() {
        let credential = Credential {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: "Bearer".to_string(),
            expiry_date: Some(1_700_000_000),
            scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
        };
        let json = serde_json::to_string(&credential).unwrap();
        let back: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(back, credential);
    }

    #[test]
    fn test_validity_uses_skew() {
        let mut credential = Credential {
            access_token: "a".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expiry_date: Some(1_000),
            scopes: vec![],
        };
        assert!(credential.is_valid_at(900));
        assert!(!credential.is_valid_at(950));
        credential.expiry_date = None;
        assert!(credential.is_valid_at(i64::MAX));
    }

    #[test]
    fn test_token_response_keeps_refresh_token() {
        let previous = Credential {
            access_token: "old".to_string(),
            refresh_token: Some("keep-me".to_string()),
            token_type: "Bearer".to_string(),
            expiry_date: Some(0),
            scopes: vec!["scope-a".to_string()],
        };
        let response: TokenGrant =
            serde_json::from_str(r#"{"access_token":"new","expires_in":3600}"#).unwrap();
        let refreshed = response.into_credential(Some(&previous), &[]);
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(refreshed.scopes, vec!["scope-a".to_string()]);
        assert!(refreshed.is_valid());
    }

    #[test]
    fn test_auth_url_contains_scopes() {
        let keys = OAuthKeys {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
        };
        let url = GoogleOAuthFlow::auth_url(
            &keys,
            "http://localhost:8080/oauth2callback",
            &["https://www.googleapis.com/auth/drive".to_string()],
        );
        assert!(url.contains("access_type=offline"));
        assert!(url.contains(&*urlencoding::encode("https://www.googleapis.com/auth/drive")));
    }
}
