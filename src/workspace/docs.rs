//! Google Docs adapter

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::pipeline::{cache_key, Pipeline};
use crate::workspace::auth::CredentialStore;
use crate::workspace::drive::DriveService;
use crate::workspace::service::ServiceClient;

/// Title and plain text of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentText {
    pub document_id: String,
    pub title: String,
    pub content: String,
}

pub struct DocsService {
    client: ServiceClient,
    drive: Arc<DriveService>,
}

impl DocsService {
    pub fn new(credentials: Arc<CredentialStore>, pipeline: Pipeline, drive: Arc<DriveService>) -> Self {
        Self {
            client: ServiceClient::new("docs", "v1", credentials, pipeline),
            drive,
        }
    }

    pub async fn create_document(&self, title: &str) -> Result<Value> {
        let body = json!({ "title": title });
        self.client
            .write("create_document", |docs| async move {
                let doc = docs.post("documents", &body).await?;
                info!(
                    "Created document: {} ({})",
                    doc["title"].as_str().unwrap_or_default(),
                    doc["documentId"].as_str().unwrap_or_default()
                );
                Ok(doc)
            })
            .await
    }

    pub async fn read_document(&self, document_id: &str) -> Result<DocumentText> {
        let key = cache_key("docs_read", &[&document_id], &[]);
        let id = document_id.to_string();
        self.client
            .read(&key, None, |docs| async move {
                let doc = docs.get(&format!("documents/{}", id), &[]).await?;
                let title = doc["title"].as_str().unwrap_or_default().to_string();
                info!("Read document: {}", title);
                Ok(DocumentText {
                    document_id: doc["documentId"].as_str().unwrap_or(&id).to_string(),
                    title,
                    content: document_text(&doc),
                })
            })
            .await
    }

    /// Insert `text` at `index` (1 is the start of the body)
    pub async fn update_document(&self, document_id: &str, text: &str, index: u32) -> Result<Value> {
        let id = document_id.to_string();
        let body = json!({
            "requests": [{
                "insertText": { "location": { "index": index.max(1) }, "text": text }
            }]
        });

        let result = self
            .client
            .write("update_document", |docs| async move {
                let result = docs
                    .post(&format!("documents/{}:batchUpdate", id), &body)
                    .await?;
                info!("Updated document: {}", id);
                Ok(result)
            })
            .await?;

        self.client.invalidate(&[cache_key("docs_read", &[&document_id], &[])]).await;
        self.drive.forget_file(document_id).await;
        Ok(result)
    }

    /// Delete through Drive; Docs has no delete endpoint
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let deleted = self.drive.delete_file(document_id).await?;
        self.client.invalidate(&[cache_key("docs_read", &[&document_id], &[])]).await;
        Ok(deleted)
    }
}

/// Concatenated text runs of the document body's paragraphs
fn document_text(doc: &Value) -> String {
    let mut text = String::new();
    let content = doc["body"]["content"].as_array().map(Vec::as_slice).unwrap_or_default();
    for element in content {
        let runs = element["paragraph"]["elements"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default();
        for run in runs {
            if let Some(s) = run["textRun"]["content"].as_str() {
                text.push_str(s);
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_text_joins_runs() {
        let doc = json!({
            "body": {"content": [
                {"sectionBreak": {}},
                {"paragraph": {"elements": [
                    {"textRun": {"content": "Hello "}},
                    {"textRun": {"content": "world\n"}}
                ]}},
                {"table": {}},
                {"paragraph": {"elements": [{"inlineObjectElement": {}}, {"textRun": {"content": "Bye\n"}}]}}
            ]}
        });
        assert_eq!(document_text(&doc), "Hello world\nBye\n");
        assert_eq!(document_text(&json!({})), "");
    }
}
