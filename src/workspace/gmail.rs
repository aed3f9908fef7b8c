//! Gmail adapter
//!
//! Messages are sent as RFC 2822 text encoded with URL-safe base64, the
//! format the `messages.send` endpoint expects in its `raw` field.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Result, WorkspaceError};
use crate::pipeline::{cache_key, key_prefix, Pipeline, VOLATILE_TTL};
use crate::workspace::auth::CredentialStore;
use crate::workspace::service::ServiceClient;

/// Messages keep for longer than search results
const MESSAGE_TTL: Duration = Duration::from_secs(300);

/// Largest page `messages.list` accepts
const MAX_SEARCH_RESULTS: u32 = 500;

const USER_MESSAGES: &str = "users/me/messages";

/// Decoded view of one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub message_id: String,
    pub thread_id: String,
    pub labels: Vec<String>,
    pub snippet: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Outgoing plain-text message
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub in_reply_to: Option<String>,
}

impl OutgoingMessage {
    /// RFC 2822 rendering with CRLF line endings
    pub fn to_rfc2822(&self) -> String {
        let mut lines = vec![format!("To: {}", self.to)];
        if let Some(cc) = self.cc.as_deref().filter(|c| !c.is_empty()) {
            lines.push(format!("Cc: {}", cc));
        }
        if let Some(bcc) = self.bcc.as_deref().filter(|b| !b.is_empty()) {
            lines.push(format!("Bcc: {}", bcc));
        }
        lines.push(format!("Subject: {}", encode_header(&self.subject)));
        if let Some(reference) = &self.in_reply_to {
            lines.push(format!("In-Reply-To: {}", reference));
            lines.push(format!("References: {}", reference));
        }
        lines.push("MIME-Version: 1.0".to_string());
        lines.push("Content-Type: text/plain; charset=UTF-8".to_string());
        lines.push("Content-Transfer-Encoding: 8bit".to_string());
        lines.push(String::new());
        lines.push(self.body.clone());
        lines.join("\r\n")
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_rfc2822().as_bytes())
    }
}

/// RFC 2047 encoded-word for non-ASCII header values
fn encode_header(text: &str) -> String {
    if text.chars().all(|c| c.is_ascii() && c != '\r' && c != '\n') {
        return text.to_string();
    }
    format!("=?UTF-8?B?{}?=", STANDARD.encode(text.as_bytes()))
}

/// Decode Gmail's base64url body data (padding optional)
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Concatenated `text/plain` content of a message payload
fn plain_text(payload: &Value) -> String {
    let parts = payload["parts"].as_array();
    match parts {
        Some(parts) => parts.iter().map(plain_text_part).collect(),
        None => payload["body"]["data"]
            .as_str()
            .and_then(decode_body)
            .unwrap_or_default(),
    }
}

fn plain_text_part(part: &Value) -> String {
    if part["mimeType"].as_str() == Some("text/plain") {
        return part["body"]["data"]
            .as_str()
            .and_then(decode_body)
            .unwrap_or_default();
    }
    part["parts"]
        .as_array()
        .map(|nested| nested.iter().map(plain_text_part).collect())
        .unwrap_or_default()
}

impl MessageContent {
    fn from_api(message: &Value) -> Self {
        let headers = message["payload"]["headers"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|h| Some((h["name"].as_str()?.to_string(), h["value"].as_str()?.to_string())))
            .collect();

        Self {
            message_id: message["id"].as_str().unwrap_or_default().to_string(),
            thread_id: message["threadId"].as_str().unwrap_or_default().to_string(),
            labels: serde_json::from_value(message["labelIds"].clone()).unwrap_or_default(),
            snippet: message["snippet"].as_str().unwrap_or_default().to_string(),
            headers,
            body: plain_text(&message["payload"]),
        }
    }
}

pub struct GmailService {
    client: ServiceClient,
}

impl GmailService {
    pub fn new(credentials: Arc<CredentialStore>, pipeline: Pipeline) -> Self {
        Self {
            client: ServiceClient::new("gmail", "v1", credentials, pipeline),
        }
    }

    /// Search messages and fetch their summary headers.
    ///
    /// The listing and every per-message fetch each take a limiter
    /// admission.
    pub async fn search_messages(
        &self,
        query: &str,
        max_results: u32,
        label_ids: &[String],
    ) -> Result<Vec<Value>> {
        let labels = label_ids.join(",");
        let key = cache_key("gmail_search", &[&query, &max_results, &labels], &[]);
        let query = query.to_string();
        let label_ids = label_ids.to_vec();
        let pipeline = self.client.pipeline().clone();
        let service = self.client.name();

        self.client
            .read(&key, Some(VOLATILE_TTL), |gmail| async move {
                let mut params = vec![
                    ("q", query),
                    ("maxResults", max_results.clamp(1, MAX_SEARCH_RESULTS).to_string()),
                ];
                params.extend(label_ids.into_iter().map(|label| ("labelIds", label)));

                let listing = gmail.get(USER_MESSAGES, &params).await?;
                let ids: Vec<String> = listing["messages"]
                    .as_array()
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect();

                let mut detailed = Vec::with_capacity(ids.len());
                for id in ids {
                    pipeline.acquire(service).await?;
                    let detail = gmail
                        .get(
                            &format!("{}/{}", USER_MESSAGES, id),
                            &[
                                ("format", "metadata".to_string()),
                                ("metadataHeaders", "From".to_string()),
                                ("metadataHeaders", "To".to_string()),
                                ("metadataHeaders", "Subject".to_string()),
                                ("metadataHeaders", "Date".to_string()),
                            ],
                        )
                        .await?;
                    detailed.push(detail);
                }

                info!("Found {} messages", detailed.len());
                Ok(detailed)
            })
            .await
    }

    pub async fn read_message(&self, message_id: &str) -> Result<MessageContent> {
        let key = cache_key("gmail_read", &[&message_id], &[]);
        let id = message_id.to_string();
        self.client
            .read(&key, Some(MESSAGE_TTL), |gmail| async move {
                let message = gmail
                    .get(&format!("{}/{}", USER_MESSAGES, id), &[("format", "full".to_string())])
                    .await?;
                info!("Read message: {}", id);
                Ok(MessageContent::from_api(&message))
            })
            .await
    }

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<Value> {
        self.send("send_message", message, None).await
    }

    /// Reply in the original message's thread
    pub async fn reply_message(&self, message_id: &str, body: &str) -> Result<Value> {
        let original = self.read_message(message_id).await?;
        let to = original.headers.get("From").cloned().unwrap_or_default();
        if to.is_empty() {
            return Err(WorkspaceError::invalid_request(
                "Original message has no sender to reply to",
            )
            .with_detail("message_id", json!(message_id)));
        }
        let subject = original.headers.get("Subject").cloned().unwrap_or_default();
        let reference = original
            .headers
            .get("Message-ID")
            .or_else(|| original.headers.get("Message-Id"))
            .cloned()
            .unwrap_or_else(|| message_id.to_string());

        let reply = OutgoingMessage {
            to,
            subject: reply_subject(&subject),
            body: body.to_string(),
            in_reply_to: Some(reference),
            ..OutgoingMessage::default()
        };
        self.send("reply_message", reply, Some(original.thread_id)).await
    }

    async fn send(
        &self,
        operation: &str,
        message: OutgoingMessage,
        thread_id: Option<String>,
    ) -> Result<Value> {
        let mut body = json!({ "raw": message.encode() });
        if let Some(thread) = thread_id.filter(|t| !t.is_empty()) {
            body["threadId"] = json!(thread);
        }
        self.client
            .write(operation, |gmail| async move {
                let sent = gmail.post(&format!("{}/send", USER_MESSAGES), &body).await?;
                info!("Sent message: {}", sent["id"].as_str().unwrap_or_default());
                Ok(sent)
            })
            .await
    }

    /// Move a message to the trash
    pub async fn delete_message(&self, message_id: &str) -> Result<bool> {
        let id = message_id.to_string();
        let trashed = self
            .client
            .write("delete_message", |gmail| async move {
                gmail
                    .post(&format!("{}/{}/trash", USER_MESSAGES, id), &json!({}))
                    .await?;
                info!("Deleted message: {}", id);
                Ok(true)
            })
            .await?;
        self.forget_message(message_id).await;
        Ok(trashed)
    }

    pub async fn list_labels(&self) -> Result<Vec<Value>> {
        let key = cache_key("gmail_labels", &[], &[]);
        self.client
            .read(&key, Some(MESSAGE_TTL), |gmail| async move {
                let response = gmail.get("users/me/labels", &[]).await?;
                let labels = response["labels"].as_array().cloned().unwrap_or_default();
                info!("Found {} labels", labels.len());
                Ok(labels)
            })
            .await
    }

    pub async fn modify_labels(
        &self,
        message_id: &str,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<Value> {
        if add_labels.is_empty() && remove_labels.is_empty() {
            warn!("modify_labels called without any label changes");
        }
        let id = message_id.to_string();
        let mut body = json!({});
        if !add_labels.is_empty() {
            body["addLabelIds"] = json!(add_labels);
        }
        if !remove_labels.is_empty() {
            body["removeLabelIds"] = json!(remove_labels);
        }

        let result = self
            .client
            .write("modify_labels", |gmail| async move {
                let result = gmail
                    .post(&format!("{}/{}/modify", USER_MESSAGES, id), &body)
                    .await?;
                info!("Modified labels for message: {}", id);
                Ok(result)
            })
            .await?;
        self.forget_message(message_id).await;
        Ok(result)
    }

    /// Forget a cached message along with cached searches, whose label
    /// filters may no longer match
    async fn forget_message(&self, message_id: &str) {
        self.client
            .invalidate(&[cache_key("gmail_read", &[&message_id], &[])])
            .await;
        self.client
            .invalidate_prefixes(&[key_prefix("gmail_search", &[])])
            .await;
    }
}

fn reply_subject(subject: &str) -> String {
    if subject.get(..3).is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2822_headers() {
        let message = OutgoingMessage {
            to: "a@example.com".to_string(),
            subject: "Hi".to_string(),
            body: "Body".to_string(),
            cc: Some("c@example.com".to_string()),
            ..OutgoingMessage::default()
        };
        let raw = message.to_rfc2822();
        assert!(raw.starts_with("To: a@example.com\r\nCc: c@example.com\r\nSubject: Hi\r\n"));
        assert!(raw.ends_with("\r\n\r\nBody"));
        assert!(!raw.contains("Bcc:"));
    }

    #[test]
    fn test_non_ascii_subject_encoded() {
        assert_eq!(encode_header("Plain"), "Plain");
        assert!(encode_header("Café").starts_with("=?UTF-8?B?"));
    }

    #[test]
    fn test_encode_is_url_safe() {
        let message = OutgoingMessage {
            to: "a@example.com".to_string(),
            subject: "???>>>".to_string(),
            body: "~~~".to_string(),
            ..OutgoingMessage::default()
        };
        let encoded = message.encode();
        assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
        let decoded = URL_SAFE_NO_PAD.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), message.to_rfc2822());
    }

    #[test]
    fn test_message_content_from_multipart() {
        let text = URL_SAFE.encode("Hello there");
        let message = json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX"],
            "snippet": "Hello",
            "payload": {
                "headers": [{"name": "From", "value": "b@example.com"}],
                "parts": [
                    {"mimeType": "text/html", "body": {"data": URL_SAFE.encode("<p>x</p>")}},
                    {"mimeType": "multipart/alternative", "parts": [
                        {"mimeType": "text/plain", "body": {"data": text}}
                    ]}
                ]
            }
        });
        let content = MessageContent::from_api(&message);
        assert_eq!(content.body, "Hello there");
        assert_eq!(content.headers["From"], "b@example.com");
        assert_eq!(content.labels, vec!["INBOX".to_string()]);
    }

    #[test]
    fn test_reply_subject() {
        assert_eq!(reply_subject("Lunch"), "Re: Lunch");
        assert_eq!(reply_subject("RE: Lunch"), "RE: Lunch");
    }
}
