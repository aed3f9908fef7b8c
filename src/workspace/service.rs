//! Authenticated REST handles for the Workspace APIs

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ErrorKind, Result};
use crate::pipeline::{ApiError, Pipeline};
use crate::workspace::auth::CredentialStore;

/// REST root for a known `(service, version)` pair
pub fn base_url(service: &str, version: &str) -> Option<&'static str> {
    match (service, version) {
        ("drive", "v3") => Some("https://www.googleapis.com/drive/v3"),
        ("docs", "v1") => Some("https://docs.googleapis.com/v1"),
        ("sheets", "v4") => Some("https://sheets.googleapis.com/v4"),
        ("slides", "v1") => Some("https://slides.googleapis.com/v1"),
        ("forms", "v1") => Some("https://forms.googleapis.com/v1"),
        ("gmail", "v1") => Some("https://gmail.googleapis.com/gmail/v1"),
        _ => None,
    }
}

/// Media upload root for Drive
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";

/// Client for one Workspace API, authenticated through the credential store.
///
/// Every request asks the store for a bearer token, so an expired token is
/// refreshed transparently. Non-success responses come back as [`ApiError`].
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    version: String,
    base_url: &'static str,
    credentials: Arc<CredentialStore>,
    http_client: reqwest::Client,
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ServiceHandle {
    pub(crate) fn new(
        name: &str,
        version: &str,
        base_url: &'static str,
        credentials: Arc<CredentialStore>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            base_url,
            credentials,
            http_client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http_client.request(method, self.url(path))
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<Value> {
        self.send_json(self.request(Method::GET, path).query(query)).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> anyhow::Result<Value> {
        self.send_json(self.request(Method::POST, path).json(body)).await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> anyhow::Result<Value> {
        self.send_json(self.request(Method::PUT, path).query(query).json(body))
            .await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> anyhow::Result<Value> {
        self.send_json(self.request(Method::PATCH, path).query(query).json(body))
            .await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    /// GET returning the raw body as text (file downloads and exports)
    pub async fn get_text(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<String> {
        let response = self.send(self.request(Method::GET, path).query(query)).await?;
        Ok(response.text().await?)
    }

    /// Replace a Drive file's content via a simple media upload
    pub async fn upload_media(
        &self,
        file_id: &str,
        mime_type: &str,
        content: String,
    ) -> anyhow::Result<Value> {
        let url = format!("{}/files/{}", DRIVE_UPLOAD_URL, file_id);
        let request = self
            .http_client
            .patch(url)
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(content);
        self.send_json(request).await
    }

    async fn send_json(&self, request: RequestBuilder) -> anyhow::Result<Value> {
        let response = self.send(request).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn send(&self, request: RequestBuilder) -> anyhow::Result<reqwest::Response> {
        let token = self.credentials.access_token().await?;
        let response = request.bearer_auth(&token).send().await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            debug!(service = %self.name, status = %response.status(), "API request failed");
            Err(ApiError::from_response(&self.name, response).await.into())
        }
    }
}

/// Adapter-side owner of one lazily built [`ServiceHandle`].
///
/// Calls are routed through the shared [`Pipeline`] under the service's
/// name. An authentication failure drops the held handle so the next call
/// builds a fresh one.
pub struct ServiceClient {
    name: &'static str,
    version: &'static str,
    credentials: Arc<CredentialStore>,
    pipeline: Pipeline,
    handle: Mutex<Option<ServiceHandle>>,
}

impl ServiceClient {
    pub fn new(
        name: &'static str,
        version: &'static str,
        credentials: Arc<CredentialStore>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            name,
            version,
            credentials,
            pipeline,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The held handle, built on first use
    pub async fn handle(&self) -> Result<ServiceHandle> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = self.credentials.get_service(self.name, self.version).await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub async fn reset(&self) {
        if self.handle.lock().await.take().is_some() {
            info!(service = self.name, "Dropped service handle after authentication failure");
        }
    }

    /// Cached, rate-limited read keyed by `key`
    pub async fn read<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, call: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(ServiceHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let handle = self.handle().await?;
        let result = self
            .pipeline
            .read(self.name, key, ttl, move || call(handle))
            .await;
        self.observe(result).await
    }

    /// Rate-limited mutation
    pub async fn write<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(ServiceHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let handle = self.handle().await?;
        let result = self
            .pipeline
            .write(self.name, operation, move || call(handle))
            .await;
        self.observe(result).await
    }

    /// Forget cached reads after a mutation
    pub async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            self.pipeline.invalidate(self.name, key).await;
        }
    }

    /// Forget every cached read under each key prefix
    pub async fn invalidate_prefixes(&self, prefixes: &[String]) {
        for prefix in prefixes {
            self.pipeline.invalidate_prefix(self.name, prefix).await;
        }
    }

    async fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.kind() == ErrorKind::Authentication {
                self.reset().await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_services_have_base_urls() {
        for (service, version) in [
            ("drive", "v3"),
            ("docs", "v1"),
            ("sheets", "v4"),
            ("slides", "v1"),
            ("forms", "v1"),
            ("gmail", "v1"),
        ] {
            assert!(base_url(service, version).is_some(), "{} {}", service, version);
        }
        assert!(base_url("calendar", "v3").is_none());
        assert!(base_url("drive", "v2").is_none());
    }

    #[test]
    fn test_handle_debug_omits_credentials() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::Config::with_dir(dir.path().to_path_buf());
        let handle = ServiceHandle::new(
            "drive",
            "v3",
            "https://www.googleapis.com/drive/v3",
            Arc::new(CredentialStore::new(config)),
            reqwest::Client::new(),
        );
        let rendered = format!("{:?}", handle);
        assert!(rendered.starts_with("ServiceHandle {"), "{}", rendered);
        assert!(rendered.contains("\"drive\""), "{}", rendered);
        assert!(!rendered.contains("credentials"), "{}", rendered);
    }
}
