//! Google Drive adapter

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::pipeline::{cache_key, key_prefix, Pipeline};
use crate::workspace::auth::CredentialStore;
use crate::workspace::service::ServiceClient;

const FILE_FIELDS: &str = "id, name, mimeType, modifiedTime, size, parents";

/// Page size ceiling accepted by `files.list`
const MAX_PAGE_SIZE: u32 = 1000;

/// Metadata and text content of one Drive file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub metadata: Value,
    pub content: String,
}

pub struct DriveService {
    client: ServiceClient,
}

impl DriveService {
    pub fn new(credentials: Arc<CredentialStore>, pipeline: Pipeline) -> Self {
        Self {
            client: ServiceClient::new("drive", "v3", credentials, pipeline),
        }
    }

    /// Search files by name fragment, parent folder and MIME type
    pub async fn search_files(
        &self,
        query: Option<&str>,
        folder_id: Option<&str>,
        file_type: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<Value>> {
        let q = search_query(query, folder_id, file_type);
        let key = cache_key(
            "search",
            &[
                &query.unwrap_or_default(),
                &folder_id.unwrap_or_default(),
                &file_type.unwrap_or_default(),
                &max_results,
            ],
            &[],
        );

        self.client
            .read(&key, None, |drive| async move {
                let params = [
                    ("pageSize", max_results.clamp(1, MAX_PAGE_SIZE).to_string()),
                    ("fields", format!("files({})", FILE_FIELDS)),
                    ("q", q),
                ];
                let response = drive.get("files", &params).await?;
                let files = list_field(&response, "files");
                info!("Found {} files", files.len());
                Ok(files)
            })
            .await
    }

    /// Read a file's metadata and content.
    ///
    /// Native Workspace files are exported (as `text/plain` unless
    /// `mime_type` says otherwise); anything else is downloaded.
    pub async fn read_file(&self, file_id: &str, mime_type: Option<&str>) -> Result<FileContent> {
        let key = cache_key("read", &[&file_id, &mime_type.unwrap_or_default()], &[]);
        let file_id = file_id.to_string();
        let mime_type = mime_type.map(str::to_string);

        self.client
            .read(&key, None, |drive| async move {
                let path = format!("files/{}", file_id);
                let metadata = drive
                    .get(&path, &[("fields", "id, name, mimeType, modifiedTime, size".to_string())])
                    .await?;
                let native = metadata["mimeType"]
                    .as_str()
                    .is_some_and(|m| m.contains("google-apps"));

                let content = match (mime_type, native) {
                    (Some(export), _) => {
                        drive
                            .get_text(&format!("{}/export", path), &[("mimeType", export)])
                            .await?
                    }
                    (None, true) => {
                        drive
                            .get_text(
                                &format!("{}/export", path),
                                &[("mimeType", "text/plain".to_string())],
                            )
                            .await?
                    }
                    (None, false) => drive.get_text(&path, &[("alt", "media".to_string())]).await?,
                };

                info!("Read file: {}", metadata["name"].as_str().unwrap_or(&file_id));
                Ok(FileContent { metadata, content })
            })
            .await
    }

    /// Create a file, optionally inside `folder_id`, with text content
    pub async fn create_file(
        &self,
        name: &str,
        content: &str,
        mime_type: &str,
        folder_id: Option<&str>,
    ) -> Result<Value> {
        let mut metadata = json!({ "name": name, "mimeType": mime_type });
        if let Some(folder) = folder_id {
            metadata["parents"] = json!([folder]);
        }
        let content = content.to_string();
        let mime_type = mime_type.to_string();

        self.client
            .write("create_file", |drive| async move {
                let created = drive.post("files", &metadata).await?;
                let id = created["id"].as_str().unwrap_or_default().to_string();
                if !content.is_empty() && !id.is_empty() {
                    drive.upload_media(&id, &mime_type, content).await?;
                }
                info!("Created file: {} ({})", created["name"].as_str().unwrap_or_default(), id);
                Ok(created)
            })
            .await
    }

    /// Rename a file and/or replace its content
    pub async fn update_file(
        &self,
        file_id: &str,
        content: Option<&str>,
        name: Option<&str>,
    ) -> Result<Value> {
        let id = file_id.to_string();
        let content = content.map(str::to_string);
        let name = name.map(str::to_string);

        let updated = self
            .client
            .write("update_file", |drive| async move {
                let path = format!("files/{}", id);
                let fields = [("fields", "id, name, modifiedTime".to_string())];
                let mut updated = match name {
                    Some(name) => drive.patch(&path, &fields, &json!({ "name": name })).await?,
                    None => drive.get(&path, &fields).await?,
                };
                if let Some(content) = content {
                    updated = drive.upload_media(&id, "text/plain", content).await?;
                }
                info!("Updated file: {}", id);
                Ok(updated)
            })
            .await?;

        self.forget_file(file_id).await;
        Ok(updated)
    }

    /// Permanently delete a file (Docs, Sheets, Slides and Forms included)
    pub async fn delete_file(&self, file_id: &str) -> Result<bool> {
        let id = file_id.to_string();
        let deleted = self
            .client
            .write("delete_file", |drive| async move {
                drive.delete(&format!("files/{}", id)).await?;
                info!("Deleted file: {}", id);
                Ok(true)
            })
            .await?;

        self.forget_file(file_id).await;
        Ok(deleted)
    }

    /// Forget cached reads of a file in every export format, along with
    /// cached searches that may list it
    pub(crate) async fn forget_file(&self, file_id: &str) {
        self.client
            .invalidate_prefixes(&[key_prefix("read", &[&file_id]), key_prefix("search", &[])])
            .await;
    }

    /// Shared drives visible to the user
    pub async fn list_shared_drives(&self, page_size: u32) -> Result<Vec<Value>> {
        let key = cache_key("shared_drives", &[&page_size], &[]);
        self.client
            .read(&key, None, |drive| async move {
                let response = drive
                    .get("drives", &[("pageSize", page_size.clamp(1, 100).to_string())])
                    .await?;
                Ok(list_field(&response, "drives"))
            })
            .await
    }
}

/// Drive `q` expression for the given filters
pub(crate) fn search_query(
    query: Option<&str>,
    folder_id: Option<&str>,
    file_type: Option<&str>,
) -> String {
    let mut parts = Vec::new();
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        parts.push(format!("name contains '{}'", escape(query)));
    }
    if let Some(folder) = folder_id.filter(|f| !f.is_empty()) {
        parts.push(format!("'{}' in parents", escape(folder)));
    }
    if let Some(mime) = file_type.filter(|m| !m.is_empty()) {
        parts.push(format!("mimeType='{}'", escape(mime)));
    }
    parts.push("trashed = false".to_string());
    parts.join(" and ")
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

pub(crate) fn list_field(response: &Value, field: &str) -> Vec<Value> {
    response[field].as_array().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_query_combines_filters() {
        let q = search_query(Some("budget"), Some("folder1"), Some("application/pdf"));
        assert_eq!(
            q,
            "name contains 'budget' and 'folder1' in parents and mimeType='application/pdf' and trashed = false"
        );
    }

    #[test]
    fn test_search_query_escapes_quotes() {
        let q = search_query(Some("Bob's notes"), None, None);
        assert_eq!(q, "name contains 'Bob\\'s notes' and trashed = false");
    }

    #[test]
    fn test_list_field_missing_is_empty() {
        assert!(list_field(&json!({}), "files").is_empty());
        assert_eq!(list_field(&json!({"files": [1, 2]}), "files").len(), 2);
    }
}
