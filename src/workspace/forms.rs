//! Google Forms adapter

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::pipeline::{cache_key, Pipeline, VOLATILE_TTL};
use crate::workspace::auth::CredentialStore;
use crate::workspace::drive::DriveService;
use crate::workspace::service::ServiceClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormItem {
    pub item_id: String,
    pub title: String,
    /// Question kind such as `textQuestion`, or `other` for non-questions
    pub question_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSummary {
    pub form_id: String,
    pub title: String,
    pub items: Vec<FormItem>,
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormResponses {
    pub form_id: String,
    pub response_count: usize,
    pub responses: Vec<Value>,
}

impl FormSummary {
    fn from_api(form: &Value) -> Self {
        let items: Vec<FormItem> = form["items"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|item| FormItem {
                item_id: item["itemId"].as_str().unwrap_or_default().to_string(),
                title: item["title"].as_str().unwrap_or_default().to_string(),
                question_type: item["questionItem"]["question"]
                    .as_object()
                    .and_then(|q| q.keys().find(|k| *k != "questionId" && *k != "required"))
                    .cloned()
                    .unwrap_or_else(|| "other".to_string()),
            })
            .collect();

        Self {
            form_id: form["formId"].as_str().unwrap_or_default().to_string(),
            title: form["info"]["title"].as_str().unwrap_or_default().to_string(),
            item_count: items.len(),
            items,
        }
    }
}

pub struct FormsService {
    client: ServiceClient,
    drive: Arc<DriveService>,
}

impl FormsService {
    pub fn new(credentials: Arc<CredentialStore>, pipeline: Pipeline, drive: Arc<DriveService>) -> Self {
        Self {
            client: ServiceClient::new("forms", "v1", credentials, pipeline),
            drive,
        }
    }

    pub async fn create_form(&self, title: &str, document_title: Option<&str>) -> Result<Value> {
        let body = json!({
            "info": { "title": title, "documentTitle": document_title.unwrap_or(title) }
        });
        self.client
            .write("create_form", |forms| async move {
                let created = forms.post("forms", &body).await?;
                info!("Created form: {}", created["formId"].as_str().unwrap_or_default());
                Ok(created)
            })
            .await
    }

    pub async fn read_form(&self, form_id: &str) -> Result<FormSummary> {
        let key = cache_key("forms_read", &[&form_id], &[]);
        let id = form_id.to_string();
        self.client
            .read(&key, None, |forms| async move {
                let form = forms.get(&format!("forms/{}", id), &[]).await?;
                let summary = FormSummary::from_api(&form);
                info!("Read form: {}", summary.title);
                Ok(summary)
            })
            .await
    }

    pub async fn update_form(&self, form_id: &str, requests: Vec<Value>) -> Result<Value> {
        let id = form_id.to_string();
        let body = json!({ "requests": requests });
        let result = self
            .client
            .write("update_form", |forms| async move {
                let result = forms.post(&format!("forms/{}:batchUpdate", id), &body).await?;
                info!("Updated form: {}", id);
                Ok(result)
            })
            .await?;

        self.client.invalidate(&[cache_key("forms_read", &[&form_id], &[])]).await;
        self.drive.forget_file(form_id).await;
        Ok(result)
    }

    /// Responses change often, so they are cached briefly
    pub async fn get_responses(&self, form_id: &str) -> Result<FormResponses> {
        let key = cache_key("forms_responses", &[&form_id], &[]);
        let id = form_id.to_string();
        self.client
            .read(&key, Some(VOLATILE_TTL), |forms| async move {
                let response = forms.get(&format!("forms/{}/responses", id), &[]).await?;
                let responses = response["responses"].as_array().cloned().unwrap_or_default();
                info!("Retrieved {} responses from form: {}", responses.len(), id);
                Ok(FormResponses {
                    form_id: id,
                    response_count: responses.len(),
                    responses,
                })
            })
            .await
    }

    /// Delete through Drive
    pub async fn delete_form(&self, form_id: &str) -> Result<bool> {
        let deleted = self.drive.delete_file(form_id).await?;
        self.client
            .invalidate(&[
                cache_key("forms_read", &[&form_id], &[]),
                cache_key("forms_responses", &[&form_id], &[]),
            ])
            .await;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_summary_question_types() {
        let form = json!({
            "formId": "f1",
            "info": {"title": "Survey"},
            "items": [
                {"itemId": "a", "title": "Name", "questionItem": {"question": {"questionId": "q1", "required": true, "textQuestion": {}}}},
                {"itemId": "b", "title": "Section", "pageBreakItem": {}}
            ]
        });
        let summary = FormSummary::from_api(&form);
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.items[0].question_type, "textQuestion");
        assert_eq!(summary.items[1].question_type, "other");
    }
}
