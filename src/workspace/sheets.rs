//! Google Sheets adapter

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::pipeline::{cache_key, key_prefix, Pipeline};
use crate::workspace::auth::CredentialStore;
use crate::workspace::drive::DriveService;
use crate::workspace::service::ServiceClient;

/// Cell values of one A1 range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeValues {
    pub spreadsheet_id: String,
    pub range: String,
    pub values: Vec<Vec<Value>>,
}

pub struct SheetsService {
    client: ServiceClient,
    drive: Arc<DriveService>,
}

impl SheetsService {
    pub fn new(credentials: Arc<CredentialStore>, pipeline: Pipeline, drive: Arc<DriveService>) -> Self {
        Self {
            client: ServiceClient::new("sheets", "v4", credentials, pipeline),
            drive,
        }
    }

    pub async fn create_spreadsheet(&self, title: &str) -> Result<Value> {
        let body = json!({ "properties": { "title": title } });
        self.client
            .write("create_spreadsheet", |sheets| async move {
                let created = sheets.post("spreadsheets", &body).await?;
                info!(
                    "Created spreadsheet: {}",
                    created["spreadsheetId"].as_str().unwrap_or_default()
                );
                Ok(created)
            })
            .await
    }

    pub async fn read_range(&self, spreadsheet_id: &str, range: &str) -> Result<RangeValues> {
        let key = cache_key("sheets_read", &[&spreadsheet_id, &range], &[]);
        let id = spreadsheet_id.to_string();
        let range = range.to_string();
        self.client
            .read(&key, None, |sheets| async move {
                let path = format!("spreadsheets/{}/values/{}", id, urlencoding::encode(&range));
                let response = sheets.get(&path, &[]).await?;
                let values: Vec<Vec<Value>> =
                    serde_json::from_value(response["values"].clone()).unwrap_or_default();
                info!("Read {} rows from {}", values.len(), range);
                Ok(RangeValues {
                    spreadsheet_id: id,
                    range,
                    values,
                })
            })
            .await
    }

    /// Overwrite `range` with raw `values`
    pub async fn update_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<Value>>,
    ) -> Result<Value> {
        let id = spreadsheet_id.to_string();
        let target = range.to_string();
        let body = json!({ "values": values });

        let result = self
            .client
            .write("update_range", |sheets| async move {
                let path = format!("spreadsheets/{}/values/{}", id, urlencoding::encode(&target));
                let result = sheets
                    .put(&path, &[("valueInputOption", "RAW".to_string())], &body)
                    .await?;
                info!(
                    "Updated {} cells in {}",
                    result["updatedCells"].as_u64().unwrap_or_default(),
                    target
                );
                Ok(result)
            })
            .await?;

        // Other cached ranges may overlap the one written
        self.forget_spreadsheet(spreadsheet_id).await;
        Ok(result)
    }

    pub async fn batch_update(&self, spreadsheet_id: &str, requests: Vec<Value>) -> Result<Value> {
        let id = spreadsheet_id.to_string();
        let body = json!({ "requests": requests });
        let result = self
            .client
            .write("batch_update", |sheets| async move {
                let result = sheets
                    .post(&format!("spreadsheets/{}:batchUpdate", id), &body)
                    .await?;
                info!("Batch updated spreadsheet: {}", id);
                Ok(result)
            })
            .await?;

        self.forget_spreadsheet(spreadsheet_id).await;
        Ok(result)
    }

    /// Delete through Drive
    pub async fn delete_spreadsheet(&self, spreadsheet_id: &str) -> Result<bool> {
        let deleted = self.drive.delete_file(spreadsheet_id).await?;
        self.forget_spreadsheet(spreadsheet_id).await;
        Ok(deleted)
    }

    /// Forget every cached range of a spreadsheet and Drive's copy of it
    async fn forget_spreadsheet(&self, spreadsheet_id: &str) {
        self.client
            .invalidate_prefixes(&[key_prefix("sheets_read", &[&spreadsheet_id])])
            .await;
        self.drive.forget_file(spreadsheet_id).await;
    }
}
