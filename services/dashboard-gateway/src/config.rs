//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The session token is loaded from the SESSION_TOKEN env var or
//! `session.token_file`, never stored in the TOML directly.

use common::Secret;
use pipeline::{DEFAULT_DEBOUNCE, PathPatterns, PipelineConfig};
use serde::Deserialize;
use session::DEFAULT_REFRESH_TIMEOUT;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Dashboard backend settings
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Session credential settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the initial session token
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// Where the front end sends the user once the session cannot be renewed
    #[serde(default = "default_login_path")]
    pub login_path: String,
}

/// Path rules and timing for the request pipeline
#[derive(Debug, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "PathPatterns::default_public")]
    pub public_paths: PathPatterns,
    #[serde(default = "PathPatterns::default_silent")]
    pub silent_paths: PathPatterns,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Local listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_api_prefix() -> String {
    "/api/v1".into()
}

fn default_refresh_path() -> String {
    "/api/auth/refresh".into()
}

fn default_timeout() -> u64 {
    30
}

fn default_login_path() -> String {
    "/login".into()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE.as_millis() as u64
}

fn default_refresh_timeout() -> u64 {
    DEFAULT_REFRESH_TIMEOUT.as_secs()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4300))
}

fn default_max_connections() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_file: None,
            login_path: default_login_path(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            public_paths: PathPatterns::default_public(),
            silent_paths: PathPatterns::default_silent(),
            debounce_ms: default_debounce_ms(),
            refresh_timeout_secs: default_refresh_timeout(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Session token resolution order:
    /// 1. SESSION_TOKEN env var, unless blank
    /// 2. token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;

        let env_token = std::env::var("SESSION_TOKEN")
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());

        if let Some(token) = env_token {
            config.session.token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.session.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.session.token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    /// Parse and validate TOML without touching the environment.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        // A 401 from the refresh endpoint must never start another refresh.
        let refresh_path = config.backend.refresh_path.clone();
        config.pipeline.public_paths.push(refresh_path);
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.backend.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::invalid(
                "backend.base_url",
                format!("must start with http:// or https://, got: {base_url}"),
            ));
        }
        if !self.backend.api_prefix.starts_with('/') {
            return Err(common::Error::invalid(
                "backend.api_prefix",
                format!("must start with '/', got: {}", self.backend.api_prefix),
            ));
        }
        if self.backend.refresh_path.trim().is_empty() {
            return Err(common::Error::invalid(
                "backend.refresh_path",
                "must not be empty",
            ));
        }
        if self.backend.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "backend.timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.pipeline.refresh_timeout_secs == 0 {
            return Err(common::Error::invalid(
                "pipeline.refresh_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.gateway.max_connections == 0 {
            return Err(common::Error::invalid(
                "gateway.max_connections",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("dashboard-gateway.toml")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            public_paths: self.pipeline.public_paths.clone(),
            silent_paths: self.pipeline.silent_paths.clone(),
            api_prefix: self.backend.api_prefix.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.refresh_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.pipeline.debounce_ms)
    }
}
