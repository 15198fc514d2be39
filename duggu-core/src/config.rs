use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sfu: SfuSettings,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the WebSocket endpoint is mounted on
    pub ws_path: String,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Bound of each connection's outbound queue
    pub outbound_queue_capacity: usize,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            max_message_size: 64 * 1024,
            outbound_queue_capacity: 1000,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Media forwarding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuSettings {
    pub ice_servers: Vec<String>,
    /// Synchronization attempts per pass before deferring
    pub max_sync_attempts: u32,
    /// Delay before a deferred synchronization pass, in milliseconds
    pub resync_backoff_ms: u64,
}

impl Default for SfuSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            max_sync_attempts: 25,
            resync_backoff_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret shared with the account service
    pub jwt_secret: String,
    pub cookie_name: String,
    /// Admit connections without a token as "anonymous"
    pub allow_anonymous: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            cookie_name: "access_token".to_string(),
            allow_anonymous: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // DUGGU_SERVER__PORT, DUGGU_SFU__MAX_SYNC_ATTEMPTS, ...
        builder = builder.add_source(
            Environment::with_prefix("DUGGU")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.allowed_origins")
                .with_list_parse_key("sfu.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check for settings the server cannot run with, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            errors.push(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            ));
        }
        if self.server.outbound_queue_capacity == 0 {
            errors.push("server.outbound_queue_capacity must be at least 1".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }
        if self.sfu.max_sync_attempts == 0 {
            errors.push("sfu.max_sync_attempts must be at least 1".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if self.auth.jwt_secret.is_empty() && !self.auth.allow_anonymous {
            errors.push(
                "auth.jwt_secret is empty; set a secret or enable auth.allow_anonymous".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
