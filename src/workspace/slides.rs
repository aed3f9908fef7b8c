//! Google Slides adapter

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::pipeline::{cache_key, Pipeline};
use crate::workspace::auth::CredentialStore;
use crate::workspace::drive::DriveService;
use crate::workspace::service::ServiceClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideSummary {
    pub slide_id: String,
    pub page_elements: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationSummary {
    pub presentation_id: String,
    pub title: String,
    pub slides: Vec<SlideSummary>,
    pub slide_count: usize,
}

impl PresentationSummary {
    fn from_api(presentation: &Value) -> Self {
        let slides: Vec<SlideSummary> = presentation["slides"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|slide| SlideSummary {
                slide_id: slide["objectId"].as_str().unwrap_or_default().to_string(),
                page_elements: slide["pageElements"].as_array().map_or(0, Vec::len),
            })
            .collect();

        Self {
            presentation_id: presentation["presentationId"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            title: presentation["title"].as_str().unwrap_or_default().to_string(),
            slide_count: slides.len(),
            slides,
        }
    }
}

pub struct SlidesService {
    client: ServiceClient,
    drive: Arc<DriveService>,
}

impl SlidesService {
    pub fn new(credentials: Arc<CredentialStore>, pipeline: Pipeline, drive: Arc<DriveService>) -> Self {
        Self {
            client: ServiceClient::new("slides", "v1", credentials, pipeline),
            drive,
        }
    }

    pub async fn create_presentation(&self, title: &str) -> Result<Value> {
        let body = json!({ "title": title });
        self.client
            .write("create_presentation", |slides| async move {
                let created = slides.post("presentations", &body).await?;
                info!(
                    "Created presentation: {}",
                    created["presentationId"].as_str().unwrap_or_default()
                );
                Ok(created)
            })
            .await
    }

    pub async fn read_presentation(&self, presentation_id: &str) -> Result<PresentationSummary> {
        let key = cache_key("slides_read", &[&presentation_id], &[]);
        let id = presentation_id.to_string();
        self.client
            .read(&key, None, |slides| async move {
                let presentation = slides.get(&format!("presentations/{}", id), &[]).await?;
                let summary = PresentationSummary::from_api(&presentation);
                info!("Read presentation: {}", summary.title);
                Ok(summary)
            })
            .await
    }

    /// Append a blank slide, or insert it at `insertion_index`
    pub async fn add_slide(&self, presentation_id: &str, insertion_index: Option<u32>) -> Result<Value> {
        let mut create = json!({});
        if let Some(index) = insertion_index {
            create["insertionIndex"] = json!(index);
        }
        self.update_slides(
            presentation_id,
            vec![json!({ "createSlide": create })],
            "add_slide",
        )
        .await
    }

    /// Apply raw `batchUpdate` requests
    pub async fn update_slide(&self, presentation_id: &str, requests: Vec<Value>) -> Result<Value> {
        self.update_slides(presentation_id, requests, "update_slide").await
    }

    async fn update_slides(
        &self,
        presentation_id: &str,
        requests: Vec<Value>,
        operation: &str,
    ) -> Result<Value> {
        let id = presentation_id.to_string();
        let body = json!({ "requests": requests });
        let result = self
            .client
            .write(operation, |slides| async move {
                let result = slides
                    .post(&format!("presentations/{}:batchUpdate", id), &body)
                    .await?;
                info!("Updated slides in presentation: {}", id);
                Ok(result)
            })
            .await?;

        self.client
            .invalidate(&[cache_key("slides_read", &[&presentation_id], &[])])
            .await;
        self.drive.forget_file(presentation_id).await;
        Ok(result)
    }

    /// Delete through Drive
    pub async fn delete_presentation(&self, presentation_id: &str) -> Result<bool> {
        let deleted = self.drive.delete_file(presentation_id).await?;
        self.client
            .invalidate(&[cache_key("slides_read", &[&presentation_id], &[])])
            .await;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_elements() {
        let presentation = json!({
            "presentationId": "p1",
            "title": "Quarterly",
            "slides": [
                {"objectId": "s1", "pageElements": [{}, {}]},
                {"objectId": "s2"}
            ]
        });
        let summary = PresentationSummary::from_api(&presentation);
        assert_eq!(summary.slide_count, 2);
        assert_eq!(summary.slides[0].page_elements, 2);
        assert_eq!(summary.slides[1].page_elements, 0);
        assert_eq!(summary.title, "Quarterly");
    }
}
