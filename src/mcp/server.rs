//! MCP Server implementation
//!
//! Implements the Model Context Protocol server for stdio transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{Result, WorkspaceError};
use crate::mcp::tools::ToolHandler;
use crate::mcp::types::*;
use crate::workspace::Workspace;

/// MCP Server info
const SERVER_NAME: &str = "google-workspace";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const INSTRUCTIONS: &str = "Tools are prefixed by service (drive_, docs_, sheets_, slides_, forms_, gmail_). \
Reads are cached briefly; workspace_cache_stats reports cache and rate limit usage.";

/// MCP Server for Google Workspace
pub struct McpServer {
    tool_handler: Arc<ToolHandler>,
    initialized: AtomicBool,
}

impl McpServer {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            tool_handler: Arc::new(ToolHandler::new(workspace)),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout until EOF
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        info!("MCP server listening on stdio");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await?;
        info!("stdin closed, shutting down");
        Ok(())
    }

    /// Serve requests read from `reader` and write responses to `writer`.
    ///
    /// Each request runs on its own task, so a slow tool call does not hold
    /// up the ones behind it. Responses are written whole, one per line, in
    /// completion order.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(write_responses(rx, writer));

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_message(&line).await {
                    // Receiver only goes away once the writer has failed
                    let _ = tx.send(response);
                }
            });
        }

        // In-flight requests hold their own senders; the writer drains
        // until the last of them finishes.
        drop(tx);
        writer_task
            .await
            .map_err(|e| WorkspaceError::unexpected(format!("Response writer stopped: {}", e)))?
    }

    /// Handle one incoming JSON-RPC message; notifications get no response
    pub async fn handle_message(&self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                error!("Unparseable message: {}", e);
                return Some(JsonRpcResponse::error(None, JsonRpcError::parse_error(e.to_string())));
            }
        };
        debug!(method = %request.method, "Received request");

        let outcome = match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(),
            methods::INITIALIZED => {
                self.initialized.store(true, Ordering::Release);
                return None;
            }
            methods::PING => Ok(serde_json::json!({})),
            methods::LIST_TOOLS => self.handle_list_tools(),
            methods::CALL_TOOL => self.handle_call_tool(&request).await,
            _ if request.is_notification() => return None,
            _ => Err(JsonRpcError::method_not_found(&request.method)),
        };

        if request.is_notification() {
            return None;
        }
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }

    fn handle_initialize(&self) -> std::result::Result<Value, JsonRpcError> {
        to_result(InitializeResult {
            protocol_version: MCP_VERSION,
            server_info: ServerInfo {
                name: SERVER_NAME,
                version: SERVER_VERSION,
            },
            capabilities: ServerCapabilities::default(),
            instructions: Some(INSTRUCTIONS.to_string()),
        })
    }

    fn handle_list_tools(&self) -> std::result::Result<Value, JsonRpcError> {
        to_result(ListToolsResult {
            tools: self.tool_handler.list_tools(),
        })
    }

    async fn handle_call_tool(&self, request: &JsonRpcRequest) -> std::result::Result<Value, JsonRpcError> {
        let params: CallToolParams = match request.params.clone() {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| JsonRpcError::invalid_params(format!("Invalid tool parameters: {}", e)))?,
            None => return Err(JsonRpcError::invalid_params("Missing tool parameters")),
        };

        let result = self.tool_handler.call_tool(&params.name, params.arguments).await;
        to_result(result)
    }
}

async fn write_responses<W>(mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

fn to_result<T: serde::Serialize>(value: T) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}
