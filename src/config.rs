//! Configuration management for the Google Workspace MCP Server
//!
//! Handles paths, environment variables, and the throttling/caching limits
//! applied by the call pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Sliding-window limits for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum admissions within `time_window`
    pub max_requests: usize,

    /// Length of the sliding window
    pub time_window: Duration,

    /// Admissions within the last second before the smoothing delay kicks in
    pub burst_limit: usize,

    /// Delay inserted once a burst is detected
    pub burst_delay: Duration,

    /// Window waits allowed before `acquire` gives up
    pub max_wait_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            time_window: Duration::from_secs(60),
            burst_limit: 10,
            burst_delay: Duration::from_millis(100),
            max_wait_retries: 16,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(invalid("max_requests must be at least 1"));
        }
        if self.time_window.is_zero() {
            return Err(invalid("time_window must be non-zero"));
        }
        if self.burst_limit == 0 {
            return Err(invalid("burst_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Response cache limits for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,

    /// TTL used when a caller does not supply one
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(invalid("cache max_size must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration for the Google Workspace MCP Server
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for storing configuration files
    pub config_dir: PathBuf,

    /// Path to OAuth client secrets (downloaded from Google Cloud Console)
    pub client_secrets_path: PathBuf,

    /// Path to the persisted OAuth token record
    pub token_path: PathBuf,

    /// Loopback port for the OAuth redirect (0 picks a free port)
    pub oauth_callback_port: u16,

    /// OAuth scopes requested during authorization
    pub scopes: Vec<String>,

    /// Limits applied to every service's rate limiter
    pub rate_limit: RateLimitConfig,

    /// Limits applied to every service's response cache
    pub cache: CacheConfig,
}

impl Config {
    /// Create a new configuration from defaults and environment overrides
    pub fn new() -> Result<Self> {
        let config_dir = match std::env::var("GW_MCP_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => Self::default_config_dir()?,
        };
        ensure_dir(&config_dir)?;

        let mut config = Self::with_dir(config_dir);

        if let Ok(path) = std::env::var("GW_MCP_CREDENTIALS_PATH") {
            config.client_secrets_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("GW_MCP_TOKEN_PATH") {
            config.token_path = PathBuf::from(path);
        }
        if let Some(port) = env_parse("GW_MCP_OAUTH_PORT")? {
            config.oauth_callback_port = port;
        }
        if let Some(max) = env_parse("GW_MCP_MAX_REQUESTS")? {
            config.rate_limit.max_requests = max;
        }
        if let Some(secs) = env_parse("GW_MCP_TIME_WINDOW_SECS")? {
            config.rate_limit.time_window = Duration::from_secs(secs);
        }
        if let Some(burst) = env_parse("GW_MCP_BURST_LIMIT")? {
            config.rate_limit.burst_limit = burst;
        }
        if let Some(size) = env_parse("GW_MCP_CACHE_SIZE")? {
            config.cache.max_size = size;
        }
        if let Some(secs) = env_parse("GW_MCP_CACHE_TTL_SECS")? {
            config.cache.default_ttl = Duration::from_secs(secs);
        }

        config.rate_limit.validate()?;
        config.cache.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `config_dir` with default limits
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self {
            client_secrets_path: config_dir.join(CREDENTIALS_FILE),
            token_path: config_dir.join(TOKEN_FILE),
            config_dir,
            oauth_callback_port: 0,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// `~/.config/gw-mcp`
    fn default_config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| ConfigError::DirNotFound {
            path: "~".to_string(),
        })?;
        Ok(home.join(".config").join("gw-mcp"))
    }

    /// Check if the OAuth client secrets file exists
    pub fn client_secrets_exist(&self) -> bool {
        self.client_secrets_path.exists()
    }

    /// Check if a persisted token record exists
    pub fn token_exists(&self) -> bool {
        self.token_path.exists()
    }
}

/// OAuth client secrets file name
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Persisted token record file name
pub const TOKEN_FILE: &str = "token.json";

/// Scopes covering Drive, Docs, Sheets, Slides, Forms and Gmail
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/documents",
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/presentations",
    "https://www.googleapis.com/auth/forms",
    "https://www.googleapis.com/auth/gmail.modify",
];

fn invalid(message: &str) -> crate::error::WorkspaceError {
    ConfigError::InvalidConfig {
        message: message.to_string(),
    }
    .into()
}

fn ensure_dir(dir: &std::path::Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirCreationFailed {
            path: dir.display().to_string(),
        })?;
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ConfigError::InvalidConfig {
                message: format!("{} has an invalid value: {}", var, raw),
            }
            .into()
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_dir_paths() {
        let config = Config::with_dir(PathBuf::from("/tmp/gw"));
        assert_eq!(config.token_path, PathBuf::from("/tmp/gw/token.json"));
        assert_eq!(
            config.client_secrets_path,
            PathBuf::from("/tmp/gw/credentials.json")
        );
    }

    #[test]
    fn test_default_scopes() {
        let config = Config::with_dir(PathBuf::from("/tmp/gw"));
        assert_eq!(config.scopes.len(), 6);
        assert!(config.scopes.iter().any(|s| s.ends_with("gmail.modify")));
    }

    #[test]
    fn test_rate_limit_defaults() {
        let limits = RateLimitConfig::default();
        assert_eq!(limits.max_requests, 100);
        assert_eq!(limits.time_window, Duration::from_secs(60));
        assert_eq!(limits.burst_limit, 10);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let limits = RateLimitConfig {
            max_requests: 0,
            ..RateLimitConfig::default()
        };
        assert!(limits.validate().is_err());

        let cache = CacheConfig {
            max_size: 0,
            ..CacheConfig::default()
        };
        assert!(cache.validate().is_err());
    }
}
