//! MCP Tool definitions and handlers
//!
//! Each tool parses and validates its arguments, calls one adapter method and
//! renders the result as pretty JSON text. Failures are rendered with a
//! suggestion matched to the error kind.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use validator::Validate;

use crate::error::{ErrorKind, Result, WorkspaceError};
use crate::mcp::types::{CallToolResult, Tool};
use crate::workspace::gmail::OutgoingMessage;
use crate::workspace::{Workspace, SERVICES};

// ==================== Tool Arguments ====================

fn default_search_limit() -> u32 {
    10
}

fn default_mime_type() -> String {
    "text/plain".to_string()
}

fn default_insert_index() -> u32 {
    1
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DriveSearchArgs {
    /// Text the file name must contain
    pub query: Option<String>,
    /// Only files inside this folder
    pub folder_id: Option<String>,
    /// Only files of this MIME type
    pub file_type: Option<String>,
    #[serde(default = "default_search_limit")]
    #[validate(range(min = 1, max = 1000))]
    pub max_results: u32,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct FileArgs {
    #[validate(length(min = 1))]
    pub file_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DriveReadArgs {
    #[validate(length(min = 1))]
    pub file_id: String,
    /// Export format for Google Docs, Sheets and Slides files
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DriveCreateArgs {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Parent folder
    pub folder_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DriveUpdateArgs {
    #[validate(length(min = 1))]
    pub file_id: String,
    /// New text content
    pub content: Option<String>,
    /// New file name
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SharedDrivesArgs {
    #[serde(default = "default_search_limit")]
    #[validate(range(min = 1, max = 100))]
    pub page_size: u32,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct TitleArgs {
    #[validate(length(min = 1))]
    pub title: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DocumentArgs {
    #[validate(length(min = 1))]
    pub document_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DocsUpdateArgs {
    #[validate(length(min = 1))]
    pub document_id: String,
    #[validate(length(min = 1))]
    pub text: String,
    /// Insertion index; 1 is the start of the document body
    #[serde(default = "default_insert_index")]
    #[validate(range(min = 1))]
    pub index: u32,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SpreadsheetArgs {
    #[validate(length(min = 1))]
    pub spreadsheet_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SheetsRangeArgs {
    #[validate(length(min = 1))]
    pub spreadsheet_id: String,
    /// Range in A1 notation, e.g. `Sheet1!A1:C10`
    #[validate(length(min = 1))]
    pub range_name: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SheetsWriteArgs {
    #[validate(length(min = 1))]
    pub spreadsheet_id: String,
    #[validate(length(min = 1))]
    pub range_name: String,
    /// Rows of cell values
    #[validate(length(min = 1))]
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct BatchUpdateArgs {
    /// Spreadsheet, presentation or form ID
    #[validate(length(min = 1))]
    pub id: String,
    /// Raw `batchUpdate` request objects
    #[validate(length(min = 1))]
    pub requests: Vec<Value>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct PresentationArgs {
    #[validate(length(min = 1))]
    pub presentation_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct AddSlideArgs {
    #[validate(length(min = 1))]
    pub presentation_id: String,
    /// Position of the new slide; appended when omitted
    pub insertion_index: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct DeleteSlideArgs {
    #[validate(length(min = 1))]
    pub presentation_id: String,
    #[validate(length(min = 1))]
    pub slide_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct FormsCreateArgs {
    #[validate(length(min = 1))]
    pub title: String,
    /// Drive file name; defaults to the title
    pub document_title: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct FormArgs {
    #[validate(length(min = 1))]
    pub form_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct GmailSearchArgs {
    /// Gmail search syntax, e.g. `from:alice is:unread`
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_search_limit")]
    #[validate(range(min = 1, max = 500))]
    pub max_results: u32,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct MessageArgs {
    #[validate(length(min = 1))]
    pub message_id: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct GmailSendArgs {
    #[validate(email)]
    pub to: String,
    pub subject: String,
    pub body: String,
    #[validate(email)]
    pub cc: Option<String>,
    #[validate(email)]
    pub bcc: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct GmailReplyArgs {
    #[validate(length(min = 1))]
    pub message_id: String,
    #[validate(length(min = 1))]
    pub body: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct ModifyLabelsArgs {
    #[validate(length(min = 1))]
    pub message_id: String,
    #[serde(default)]
    pub add_labels: Vec<String>,
    #[serde(default)]
    pub remove_labels: Vec<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

#[derive(Debug, Default, Deserialize, JsonSchema, Validate)]
pub struct CacheStatsArgs {
    /// One service name; all services when omitted
    pub service: Option<String>,
}

// ==================== Tool Handler ====================

/// Tool handler
pub struct ToolHandler {
    workspace: Arc<Workspace>,
}

impl ToolHandler {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    /// List all available tools
    pub fn list_tools(&self) -> Vec<Tool> {
        vec![
            tool_def::<DriveSearchArgs>("drive_search_files", "Search Drive files by name, folder and type"),
            tool_def::<DriveReadArgs>("drive_read_file", "Read a Drive file's metadata and text content"),
            tool_def::<DriveCreateArgs>("drive_create_file", "Create a Drive file with text content"),
            tool_def::<DriveUpdateArgs>("drive_update_file", "Rename a Drive file or replace its content"),
            tool_def::<FileArgs>("drive_delete_file", "Permanently delete a Drive file"),
            tool_def::<SharedDrivesArgs>("drive_list_shared_drives", "List shared drives"),
            tool_def::<TitleArgs>("docs_create", "Create a Google Docs document"),
            tool_def::<DocumentArgs>("docs_read", "Read a document's title and text"),
            tool_def::<DocsUpdateArgs>("docs_update", "Insert text into a document"),
            tool_def::<DocumentArgs>("docs_delete", "Delete a document"),
            tool_def::<TitleArgs>("sheets_create", "Create a Google Sheets spreadsheet"),
            tool_def::<SheetsRangeArgs>("sheets_read", "Read values from a spreadsheet range"),
            tool_def::<SheetsWriteArgs>("sheets_write", "Write values to a spreadsheet range"),
            tool_def::<BatchUpdateArgs>("sheets_batch_update", "Apply batchUpdate requests to a spreadsheet"),
            tool_def::<SpreadsheetArgs>("sheets_delete", "Delete a spreadsheet"),
            tool_def::<TitleArgs>("slides_create", "Create a Google Slides presentation"),
            tool_def::<PresentationArgs>("slides_read", "Read a presentation's slide structure"),
            tool_def::<AddSlideArgs>("slides_add_slide", "Add a blank slide to a presentation"),
            tool_def::<DeleteSlideArgs>("slides_delete_slide", "Remove one slide from a presentation"),
            tool_def::<PresentationArgs>("slides_delete", "Delete a presentation"),
            tool_def::<FormsCreateArgs>("forms_create", "Create a Google Form"),
            tool_def::<FormArgs>("forms_read", "Read a form's questions"),
            tool_def::<BatchUpdateArgs>("forms_update", "Apply batchUpdate requests to a form"),
            tool_def::<FormArgs>("forms_get_responses", "List a form's responses"),
            tool_def::<FormArgs>("forms_delete", "Delete a form"),
            tool_def::<GmailSearchArgs>("gmail_search_messages", "Search Gmail using Gmail search syntax"),
            tool_def::<MessageArgs>("gmail_read_message", "Read a message's headers and plain-text body"),
            tool_def::<GmailSendArgs>("gmail_send_message", "Send a plain-text email"),
            tool_def::<GmailReplyArgs>("gmail_reply_message", "Reply to a message in its thread"),
            tool_def::<NoArgs>("gmail_list_labels", "List Gmail labels"),
            tool_def::<ModifyLabelsArgs>("gmail_modify_labels", "Add or remove labels on a message"),
            tool_def::<MessageArgs>("gmail_delete_message", "Move a message to the trash"),
            tool_def::<CacheStatsArgs>("workspace_cache_stats", "Response cache and rate limiter statistics"),
        ]
    }

    /// Call a tool by name
    pub async fn call_tool(&self, name: &str, args: Value) -> CallToolResult {
        debug!(tool = name, "Calling tool");
        let outcome = match name {
            "drive_search_files" => self.drive_search_files(args).await,
            "drive_read_file" => self.drive_read_file(args).await,
            "drive_create_file" => self.drive_create_file(args).await,
            "drive_update_file" => self.drive_update_file(args).await,
            "drive_delete_file" => self.drive_delete_file(args).await,
            "drive_list_shared_drives" => self.drive_list_shared_drives(args).await,
            "docs_create" => self.docs_create(args).await,
            "docs_read" => self.docs_read(args).await,
            "docs_update" => self.docs_update(args).await,
            "docs_delete" => self.docs_delete(args).await,
            "sheets_create" => self.sheets_create(args).await,
            "sheets_read" => self.sheets_read(args).await,
            "sheets_write" => self.sheets_write(args).await,
            "sheets_batch_update" => self.sheets_batch_update(args).await,
            "sheets_delete" => self.sheets_delete(args).await,
            "slides_create" => self.slides_create(args).await,
            "slides_read" => self.slides_read(args).await,
            "slides_add_slide" => self.slides_add_slide(args).await,
            "slides_delete_slide" => self.slides_delete_slide(args).await,
            "slides_delete" => self.slides_delete(args).await,
            "forms_create" => self.forms_create(args).await,
            "forms_read" => self.forms_read(args).await,
            "forms_update" => self.forms_update(args).await,
            "forms_get_responses" => self.forms_get_responses(args).await,
            "forms_delete" => self.forms_delete(args).await,
            "gmail_search_messages" => self.gmail_search_messages(args).await,
            "gmail_read_message" => self.gmail_read_message(args).await,
            "gmail_send_message" => self.gmail_send_message(args).await,
            "gmail_reply_message" => self.gmail_reply_message(args).await,
            "gmail_list_labels" => self.gmail_list_labels().await,
            "gmail_modify_labels" => self.gmail_modify_labels(args).await,
            "gmail_delete_message" => self.gmail_delete_message(args).await,
            "workspace_cache_stats" => self.workspace_cache_stats(args).await,
            _ => return CallToolResult::failure(format!("Unknown tool: {}", name)),
        };

        match outcome {
            Ok(text) => CallToolResult::text(text),
            Err(err) => {
                warn!(tool = name, kind = %err.kind(), "Tool failed: {}", err.message());
                CallToolResult::failure(render_error(&err, name))
            }
        }
    }

    // ==================== Drive ====================

    async fn drive_search_files(&self, args: Value) -> Result<String> {
        let args: DriveSearchArgs = parse_args(args)?;
        let files = self
            .workspace
            .drive
            .search_files(
                args.query.as_deref(),
                args.folder_id.as_deref(),
                args.file_type.as_deref(),
                args.max_results,
            )
            .await?;
        to_text(&json!({ "count": files.len(), "files": files }))
    }

    async fn drive_read_file(&self, args: Value) -> Result<String> {
        let args: DriveReadArgs = parse_args(args)?;
        let file = self
            .workspace
            .drive
            .read_file(&args.file_id, args.mime_type.as_deref())
            .await?;
        to_text(&file)
    }

    async fn drive_create_file(&self, args: Value) -> Result<String> {
        let args: DriveCreateArgs = parse_args(args)?;
        let created = self
            .workspace
            .drive
            .create_file(&args.name, &args.content, &args.mime_type, args.folder_id.as_deref())
            .await?;
        to_text(&created)
    }

    async fn drive_update_file(&self, args: Value) -> Result<String> {
        let args: DriveUpdateArgs = parse_args(args)?;
        if args.content.is_none() && args.name.is_none() {
            return Err(WorkspaceError::invalid_request(
                "Provide a new name, new content, or both",
            ));
        }
        let updated = self
            .workspace
            .drive
            .update_file(&args.file_id, args.content.as_deref(), args.name.as_deref())
            .await?;
        to_text(&updated)
    }

    async fn drive_delete_file(&self, args: Value) -> Result<String> {
        let args: FileArgs = parse_args(args)?;
        self.workspace.drive.delete_file(&args.file_id).await?;
        Ok(format!("Deleted file {}", args.file_id))
    }

    async fn drive_list_shared_drives(&self, args: Value) -> Result<String> {
        let args: SharedDrivesArgs = parse_args(args)?;
        let drives = self.workspace.drive.list_shared_drives(args.page_size).await?;
        to_text(&json!({ "count": drives.len(), "drives": drives }))
    }

    // ==================== Docs ====================

    async fn docs_create(&self, args: Value) -> Result<String> {
        let args: TitleArgs = parse_args(args)?;
        to_text(&self.workspace.docs.create_document(&args.title).await?)
    }

    async fn docs_read(&self, args: Value) -> Result<String> {
        let args: DocumentArgs = parse_args(args)?;
        to_text(&self.workspace.docs.read_document(&args.document_id).await?)
    }

    async fn docs_update(&self, args: Value) -> Result<String> {
        let args: DocsUpdateArgs = parse_args(args)?;
        let result = self
            .workspace
            .docs
            .update_document(&args.document_id, &args.text, args.index)
            .await?;
        to_text(&result)
    }

    async fn docs_delete(&self, args: Value) -> Result<String> {
        let args: DocumentArgs = parse_args(args)?;
        self.workspace.docs.delete_document(&args.document_id).await?;
        Ok(format!("Deleted document {}", args.document_id))
    }

    // ==================== Sheets ====================

    async fn sheets_create(&self, args: Value) -> Result<String> {
        let args: TitleArgs = parse_args(args)?;
        to_text(&self.workspace.sheets.create_spreadsheet(&args.title).await?)
    }

    async fn sheets_read(&self, args: Value) -> Result<String> {
        let args: SheetsRangeArgs = parse_args(args)?;
        let values = self
            .workspace
            .sheets
            .read_range(&args.spreadsheet_id, &args.range_name)
            .await?;
        to_text(&values)
    }

    async fn sheets_write(&self, args: Value) -> Result<String> {
        let args: SheetsWriteArgs = parse_args(args)?;
        let result = self
            .workspace
            .sheets
            .update_range(&args.spreadsheet_id, &args.range_name, args.values)
            .await?;
        to_text(&result)
    }

    async fn sheets_batch_update(&self, args: Value) -> Result<String> {
        let args: BatchUpdateArgs = parse_args(args)?;
        to_text(&self.workspace.sheets.batch_update(&args.id, args.requests).await?)
    }

    async fn sheets_delete(&self, args: Value) -> Result<String> {
        let args: SpreadsheetArgs = parse_args(args)?;
        self.workspace.sheets.delete_spreadsheet(&args.spreadsheet_id).await?;
        Ok(format!("Deleted spreadsheet {}", args.spreadsheet_id))
    }

    // ==================== Slides ====================

    async fn slides_create(&self, args: Value) -> Result<String> {
        let args: TitleArgs = parse_args(args)?;
        to_text(&self.workspace.slides.create_presentation(&args.title).await?)
    }

    async fn slides_read(&self, args: Value) -> Result<String> {
        let args: PresentationArgs = parse_args(args)?;
        to_text(&self.workspace.slides.read_presentation(&args.presentation_id).await?)
    }

    async fn slides_add_slide(&self, args: Value) -> Result<String> {
        let args: AddSlideArgs = parse_args(args)?;
        let result = self
            .workspace
            .slides
            .add_slide(&args.presentation_id, args.insertion_index)
            .await?;
        to_text(&result)
    }

    async fn slides_delete_slide(&self, args: Value) -> Result<String> {
        let args: DeleteSlideArgs = parse_args(args)?;
        let request = json!({ "deleteObject": { "objectId": args.slide_id } });
        self.workspace
            .slides
            .update_slide(&args.presentation_id, vec![request])
            .await?;
        Ok(format!("Deleted slide {} from {}", args.slide_id, args.presentation_id))
    }

    async fn slides_delete(&self, args: Value) -> Result<String> {
        let args: PresentationArgs = parse_args(args)?;
        self.workspace.slides.delete_presentation(&args.presentation_id).await?;
        Ok(format!("Deleted presentation {}", args.presentation_id))
    }

    // ==================== Forms ====================

    async fn forms_create(&self, args: Value) -> Result<String> {
        let args: FormsCreateArgs = parse_args(args)?;
        let created = self
            .workspace
            .forms
            .create_form(&args.title, args.document_title.as_deref())
            .await?;
        to_text(&created)
    }

    async fn forms_read(&self, args: Value) -> Result<String> {
        let args: FormArgs = parse_args(args)?;
        to_text(&self.workspace.forms.read_form(&args.form_id).await?)
    }

    async fn forms_update(&self, args: Value) -> Result<String> {
        let args: BatchUpdateArgs = parse_args(args)?;
        to_text(&self.workspace.forms.update_form(&args.id, args.requests).await?)
    }

    async fn forms_get_responses(&self, args: Value) -> Result<String> {
        let args: FormArgs = parse_args(args)?;
        to_text(&self.workspace.forms.get_responses(&args.form_id).await?)
    }

    async fn forms_delete(&self, args: Value) -> Result<String> {
        let args: FormArgs = parse_args(args)?;
        self.workspace.forms.delete_form(&args.form_id).await?;
        Ok(format!("Deleted form {}", args.form_id))
    }

    // ==================== Gmail ====================

    async fn gmail_search_messages(&self, args: Value) -> Result<String> {
        let args: GmailSearchArgs = parse_args(args)?;
        let messages = self
            .workspace
            .gmail
            .search_messages(&args.query, args.max_results, &args.label_ids)
            .await?;
        to_text(&json!({ "count": messages.len(), "messages": messages }))
    }

    async fn gmail_read_message(&self, args: Value) -> Result<String> {
        let args: MessageArgs = parse_args(args)?;
        to_text(&self.workspace.gmail.read_message(&args.message_id).await?)
    }

    async fn gmail_send_message(&self, args: Value) -> Result<String> {
        let args: GmailSendArgs = parse_args(args)?;
        let message = OutgoingMessage {
            to: args.to,
            subject: args.subject,
            body: args.body,
            cc: args.cc,
            bcc: args.bcc,
            in_reply_to: None,
        };
        to_text(&self.workspace.gmail.send_message(message).await?)
    }

    async fn gmail_reply_message(&self, args: Value) -> Result<String> {
        let args: GmailReplyArgs = parse_args(args)?;
        let sent = self
            .workspace
            .gmail
            .reply_message(&args.message_id, &args.body)
            .await?;
        to_text(&sent)
    }

    async fn gmail_list_labels(&self) -> Result<String> {
        let labels = self.workspace.gmail.list_labels().await?;
        to_text(&json!({ "count": labels.len(), "labels": labels }))
    }

    async fn gmail_modify_labels(&self, args: Value) -> Result<String> {
        let args: ModifyLabelsArgs = parse_args(args)?;
        if args.add_labels.is_empty() && args.remove_labels.is_empty() {
            return Err(WorkspaceError::invalid_request(
                "Provide labels to add or remove",
            ));
        }
        let result = self
            .workspace
            .gmail
            .modify_labels(&args.message_id, &args.add_labels, &args.remove_labels)
            .await?;
        to_text(&result)
    }

    async fn gmail_delete_message(&self, args: Value) -> Result<String> {
        let args: MessageArgs = parse_args(args)?;
        self.workspace.gmail.delete_message(&args.message_id).await?;
        Ok(format!("Moved message {} to trash", args.message_id))
    }

    // ==================== Diagnostics ====================

    async fn workspace_cache_stats(&self, args: Value) -> Result<String> {
        let args: CacheStatsArgs = parse_args(args)?;
        let services: Vec<&str> = match args.service.as_deref() {
            Some(service) if SERVICES.contains(&service) => vec![service],
            Some(service) => {
                return Err(WorkspaceError::invalid_request(format!(
                    "Unknown service '{}'; expected one of {}",
                    service,
                    SERVICES.join(", ")
                )))
            }
            None => SERVICES.to_vec(),
        };

        let pipeline = &self.workspace.pipeline;
        let mut report = serde_json::Map::new();
        for service in services {
            report.insert(
                service.to_string(),
                json!({
                    "cache": pipeline.cache_stats(service).await,
                    "rate_limit": pipeline.rate_stats(service).await,
                }),
            );
        }
        to_text(&report)
    }
}

// ==================== Helpers ====================

fn tool_def<A: JsonSchema>(name: &str, description: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: input_schema::<A>(),
    }
}

/// JSON Schema for `A` without the root `$schema`/`title` noise
pub fn input_schema<A: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(A))
        .unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(root) = schema.as_object_mut() {
        root.remove("$schema");
        root.remove("title");
    }
    schema
}

/// Deserialize and validate tool arguments; missing arguments read as `{}`
fn parse_args<A: DeserializeOwned + Validate>(args: Value) -> Result<A> {
    let args = if args.is_null() { json!({}) } else { args };
    let parsed: A = serde_json::from_value(args).map_err(|e| {
        WorkspaceError::invalid_request(format!("Invalid arguments: {}", e)).with_cause(e)
    })?;
    parsed.validate()?;
    Ok(parsed)
}

fn to_text<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Suggested next step for each error kind
pub fn suggestion(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Authentication => {
            "Your authentication token may have expired. Run `google-workspace-mcp auth` to re-authenticate."
        }
        ErrorKind::Permission => "Check that you have the necessary permissions for this operation.",
        ErrorKind::NotFound => "Verify the ID and ensure you have access to this resource.",
        ErrorKind::RateLimit => "You've hit API rate limits. Wait a moment and try again.",
        ErrorKind::InvalidRequest => "Check the tool arguments and try again.",
        ErrorKind::Unexpected => "Retry the operation. If it keeps failing, check the server logs.",
    }
}

/// Plain-text rendering of a failed tool call
pub fn render_error(err: &WorkspaceError, tool: &str) -> String {
    let mut text = format!("Error ({}): {}: {}", tool, err.kind(), err.message());
    if let Some(retry_after) = err.retry_after() {
        text.push_str(&format!("\nRetry after {} seconds.", retry_after.as_secs()));
    }
    if let Some(api_message) = err.details().get("api_message").and_then(Value::as_str) {
        text.push_str(&format!("\nAPI message: {}", api_message));
    }
    text.push_str("\n\nSuggestion: ");
    text.push_str(suggestion(err.kind()));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_args_applies_defaults() {
        let args: GmailSearchArgs = parse_args(json!({"query": "is:unread"})).unwrap();
        assert_eq!(args.max_results, 10);
        assert!(args.label_ids.is_empty());

        let args: CacheStatsArgs = parse_args(Value::Null).unwrap();
        assert!(args.service.is_none());
    }

    #[test]
    fn test_parse_args_rejects_invalid() {
        let err = parse_args::<GmailSearchArgs>(json!({"max_results": 0})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = parse_args::<FileArgs>(json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.message().starts_with("Invalid arguments"));

        let err = parse_args::<GmailSendArgs>(json!({"to": "not-an-address", "subject": "s", "body": "b"}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_input_schema_lists_properties() {
        let schema = input_schema::<SheetsRangeArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["range_name"].is_object());
        assert!(schema.get("$schema").is_none());
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"spreadsheet_id"));
    }

    #[test]
    fn test_render_error_includes_hint_and_retry() {
        let err = WorkspaceError::rate_limit("API rate limit exceeded.", Duration::from_secs(30));
        let text = render_error(&err, "gmail_search_messages");
        assert!(text.contains("RateLimitError"));
        assert!(text.contains("Retry after 30 seconds."));
        assert!(text.ends_with(suggestion(ErrorKind::RateLimit)));

        let err = WorkspaceError::not_found("Requested resource not found.")
            .with_detail("api_message", json!("File not found: abc."));
        let text = render_error(&err, "drive_read_file");
        assert!(text.contains("API message: File not found: abc."));
        assert!(text.contains("Verify the ID"));
    }
}
