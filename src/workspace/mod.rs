//! Google Workspace integration
//!
//! [`auth`] owns the OAuth credential, [`service`] binds it to the REST
//! endpoints, and one adapter per API routes calls through the shared
//! [`Pipeline`].

pub mod auth;
pub mod docs;
pub mod drive;
pub mod forms;
pub mod gmail;
pub mod service;
pub mod sheets;
pub mod slides;

use std::sync::Arc;

use crate::config::Config;
use crate::pipeline::{Pipeline, Registry};

pub use auth::{Credential, CredentialStore, GoogleOAuthFlow, OAuthFlow, OAuthKeys};
pub use service::{ServiceClient, ServiceHandle};

/// Names of the services the adapters register under
pub const SERVICES: &[&str] = &["drive", "docs", "sheets", "slides", "forms", "gmail"];

/// All adapters sharing one credential store and one pipeline
pub struct Workspace {
    pub credentials: Arc<CredentialStore>,
    pub pipeline: Pipeline,
    pub drive: Arc<drive::DriveService>,
    pub docs: docs::DocsService,
    pub sheets: sheets::SheetsService,
    pub slides: slides::SlidesService,
    pub forms: forms::FormsService,
    pub gmail: gmail::GmailService,
}

impl Workspace {
    /// Build from configuration with Google's OAuth endpoints
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(Registry::new(config.rate_limit, config.cache));
        let credentials = Arc::new(CredentialStore::new(config.clone()));
        Self::with_parts(credentials, Pipeline::new(registry))
    }

    pub fn with_parts(credentials: Arc<CredentialStore>, pipeline: Pipeline) -> Self {
        let drive = Arc::new(drive::DriveService::new(credentials.clone(), pipeline.clone()));
        Self {
            docs: docs::DocsService::new(credentials.clone(), pipeline.clone(), drive.clone()),
            sheets: sheets::SheetsService::new(credentials.clone(), pipeline.clone(), drive.clone()),
            slides: slides::SlidesService::new(credentials.clone(), pipeline.clone(), drive.clone()),
            forms: forms::FormsService::new(credentials.clone(), pipeline.clone(), drive.clone()),
            gmail: gmail::GmailService::new(credentials.clone(), pipeline.clone()),
            drive,
            credentials,
            pipeline,
        }
    }
}
