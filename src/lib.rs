//! Google Workspace MCP Server Library
//!
//! A Model Context Protocol (MCP) server exposing Drive, Docs, Sheets, Slides,
//! Forms and Gmail as tools. Every API call goes through a shared pipeline
//! that handles OAuth credentials, per-service rate limiting, response
//! caching and error translation.

pub mod config;
pub mod error;
pub mod mcp;
pub mod pipeline;
pub mod workspace;

pub use config::Config;
pub use error::{ErrorKind, Result, WorkspaceError};
pub use pipeline::{Pipeline, Registry};
pub use workspace::{CredentialStore, Workspace};
