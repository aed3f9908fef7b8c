//! Credential store tests with a scripted OAuth flow and a temporary
//! config directory

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_workspace_mcp::config::Config;
use google_workspace_mcp::error::{AuthError, Result};
use google_workspace_mcp::workspace::{Credential, CredentialStore, OAuthFlow, OAuthKeys};
use google_workspace_mcp::ErrorKind;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// OAuth flow that hands out numbered tokens and counts its invocations
#[derive(Default)]
struct ScriptedFlow {
    refreshes: AtomicUsize,
    authorizations: AtomicUsize,
    fail_refresh: bool,
    delay: Duration,
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn credential(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> Credential {
    Credential {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        token_type: "Bearer".to_string(),
        expiry_date: Some(unix_now() + expires_in),
        scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
    }
}

#[async_trait]
impl OAuthFlow for ScriptedFlow {
    async fn refresh(&self, _keys: &OAuthKeys, current: &Credential) -> Result<Credential> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail_refresh {
            return Err(AuthError::TokenRefreshFailed {
                message: "invalid_grant".to_string(),
            }
            .into());
        }
        Ok(Credential {
            access_token: format!("refreshed-{}", n),
            expiry_date: Some(unix_now() + 3600),
            ..current.clone()
        })
    }

    async fn authorize(&self, _keys: &OAuthKeys, scopes: &[String]) -> Result<Credential> {
        let n = self.authorizations.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(Credential {
            scopes: scopes.to_vec(),
            ..credential(&format!("authorized-{}", n), Some("refresh"), 3600)
        })
    }
}

fn config_with_secrets(dir: &TempDir) -> Config {
    let config = Config::with_dir(dir.path().to_path_buf());
    std::fs::write(
        &config.client_secrets_path,
        r#"{"installed": {"client_id": "id", "client_secret": "secret"}}"#,
    )
    .unwrap();
    config
}

fn write_token(config: &Config, credential: &Credential) {
    std::fs::write(&config.token_path, serde_json::to_string(credential).unwrap()).unwrap();
}

fn read_token(config: &Config) -> Credential {
    serde_json::from_str(&std::fs::read_to_string(&config.token_path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_valid_stored_credential_is_used_as_is() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    write_token(&config, &credential("stored", Some("refresh"), 3600));

    let flow = Arc::new(ScriptedFlow::default());
    let store = CredentialStore::with_flow(config, flow.clone());

    assert_eq!(store.access_token().await.unwrap(), "stored");
    assert_eq!(flow.refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(flow.authorizations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_expired_credential_is_refreshed_and_persisted() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    write_token(&config, &credential("stale", Some("refresh"), -600));

    let flow = Arc::new(ScriptedFlow::default());
    let store = Arc::new(CredentialStore::with_flow(config.clone(), flow.clone()));

    let drive = store.get_service("drive", "v3").await.unwrap();
    assert_eq!(drive.name(), "drive");
    assert_eq!(drive.url("files"), "https://www.googleapis.com/drive/v3/files");

    assert_eq!(store.access_token().await.unwrap(), "refreshed-1");
    assert_eq!(flow.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(flow.authorizations.load(Ordering::SeqCst), 0);

    let persisted = read_token(&config);
    assert_eq!(persisted.access_token, "refreshed-1");
    assert_eq!(persisted.refresh_token.as_deref(), Some("refresh"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&config.token_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_authorization() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    write_token(&config, &credential("stale", Some("revoked"), -600));

    let flow = Arc::new(ScriptedFlow {
        fail_refresh: true,
        ..ScriptedFlow::default()
    });
    let store = CredentialStore::with_flow(config.clone(), flow.clone());

    assert_eq!(store.access_token().await.unwrap(), "authorized-1");
    assert_eq!(flow.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(flow.authorizations.load(Ordering::SeqCst), 1);
    assert_eq!(read_token(&config).access_token, "authorized-1");
}

#[tokio::test]
async fn test_concurrent_callers_share_one_authorization() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    let flow = Arc::new(ScriptedFlow {
        delay: Duration::from_millis(50),
        ..ScriptedFlow::default()
    });
    let store = Arc::new(CredentialStore::with_flow(config, flow.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.get_service("drive", "v3").await }));
    }
    for handle in handles {
        let drive = handle.await.unwrap().unwrap();
        assert_eq!(drive.name(), "drive");
    }
    assert_eq!(flow.authorizations.load(Ordering::SeqCst), 1);
    assert_eq!(store.access_token().await.unwrap(), "authorized-1");
}

#[tokio::test]
async fn test_missing_client_secrets_is_authentication_error() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_dir(dir.path().to_path_buf());
    let flow = Arc::new(ScriptedFlow::default());
    let store = CredentialStore::with_flow(config, flow.clone());

    let err = assert_err!(store.access_token().await);
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(flow.authorizations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_corrupt_token_file_counts_as_missing() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    std::fs::write(&config.token_path, "{not json").unwrap();

    let flow = Arc::new(ScriptedFlow::default());
    let store = CredentialStore::with_flow(config, flow.clone());
    assert_eq!(store.access_token().await.unwrap(), "authorized-1");
}

#[tokio::test]
async fn test_forced_authentication_skips_stored_credential() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    write_token(&config, &credential("stored", Some("refresh"), 3600));

    let flow = Arc::new(ScriptedFlow::default());
    let store = CredentialStore::with_flow(config, flow.clone());

    let fresh = store.authenticate(true).await.unwrap();
    assert_eq!(fresh.access_token, "authorized-1");
    assert_eq!(store.access_token().await.unwrap(), "authorized-1");
}

#[tokio::test]
async fn test_unknown_service_is_authentication_error() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    write_token(&config, &credential("stored", None, 3600));
    let store = Arc::new(CredentialStore::with_flow(config, Arc::new(ScriptedFlow::default())));

    let err = store.get_service("calendar", "v3").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.message(), "Failed to create calendar service");
}

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = config_with_secrets(&dir);
    write_token(&config, &credential("stored", Some("refresh"), 3600));
    let store = CredentialStore::with_flow(config.clone(), Arc::new(ScriptedFlow::default()));

    assert!(store.is_authenticated().await);
    assert_ok!(store.revoke().await);
    assert!(!config.token_path.exists());
    assert!(!store.is_authenticated().await);
    assert_ok!(store.revoke().await);
}
