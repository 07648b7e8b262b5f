// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Level;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    4664
}

/// HTTP server binding and optional static web UI.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origin of the hosted web UI, always allowed by CORS when set.
    pub web_url: Option<String>,
    /// Directory of static web UI assets to serve under `/ui`.
    pub web_dir: Option<String>,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), web_url: None, web_dir: None }
    }
}

fn default_workspace_root() -> String {
    ".".to_string()
}

fn default_workspace_ignore() -> Vec<String> {
    vec!["node_modules/**".to_string(), ".git/**".to_string(), "target/**".to_string()]
}

/// Workspace the service is allowed to read `.http` files from.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct WorkspaceConfig {
    /// All `path` inputs are resolved inside this directory; anything that
    /// escapes it is rejected.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Glob patterns excluded from workspace listings.
    #[serde(default = "default_workspace_ignore")]
    pub ignore: Vec<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { root: default_workspace_root(), ignore: default_workspace_ignore() }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_script_token_ttl_ms() -> u64 {
    15 * 60 * 1000
}

/// Authentication configuration.
///
/// With no `token` configured the server trusts every caller — the intended
/// mode for a loopback-only developer instance. Setting `token` turns on
/// bearer auth, script tokens, and (optionally) cookie web-sessions.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct AuthConfig {
    /// Static bearer token. Also the HMAC key for script tokens.
    pub token: Option<String>,
    /// Allow browser login via the `treq_session` cookie.
    #[serde(default = "default_true")]
    pub allow_cookie_auth: bool,
    /// Lifetime of issued script tokens (default 15 minutes).
    #[serde(default = "default_script_token_ttl_ms")]
    pub script_token_ttl_ms: u64,
}

const fn default_max_body_bytes() -> usize {
    // Response bodies are buffered, never streamed; keep the cap modest.
    2 * 1024 * 1024
}

const fn default_max_sessions() -> usize {
    100
}

const fn default_session_ttl_ms() -> u64 {
    30 * 60 * 1000
}

const fn default_max_ws_sessions() -> usize {
    32
}

const fn default_ws_replay_buffer_size() -> usize {
    256
}

const fn default_ws_idle_timeout_ms() -> u64 {
    2 * 60 * 1000
}

const fn default_event_replay_buffer_size() -> usize {
    500
}

const fn default_timeout_ms() -> u64 {
    30_000
}

/// Resource caps. Every cap has a hard default so an unconfigured server
/// cannot grow without bound.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LimitsConfig {
    /// Response-body buffering cap in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Sessions beyond this evict the least-recently-used one.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle sessions older than this are swept (default 30 minutes).
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "default_max_ws_sessions")]
    pub max_ws_sessions: usize,
    /// Per-WS-session replay ring size, in envelopes.
    #[serde(default = "default_ws_replay_buffer_size")]
    pub ws_replay_buffer_size: usize,
    /// Idle WS sessions are closed with 1001 after this.
    #[serde(default = "default_ws_idle_timeout_ms")]
    pub ws_idle_timeout_ms: u64,
    /// Event bus replay ring size, in envelopes.
    #[serde(default = "default_event_replay_buffer_size")]
    pub event_replay_buffer_size: usize,
    /// Engine timeout when the caller does not supply `timeoutMs`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            max_sessions: default_max_sessions(),
            session_ttl_ms: default_session_ttl_ms(),
            max_ws_sessions: default_max_ws_sessions(),
            ws_replay_buffer_size: default_ws_replay_buffer_size(),
            ws_idle_timeout_ms: default_ws_idle_timeout_ms(),
            event_replay_buffer_size: default_event_replay_buffer_size(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

/// CORS configuration.
///
/// Localhost origins (`http://localhost:*`, `http://127.0.0.1:*`, plus their
/// HTTPS variants) and the configured `web_url` are always allowed;
/// `allowed_origins` adds to that set. Credentials are always allowed.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct CorsConfig {
    /// Extra allowed origins. Supports `http://host:*` port wildcards.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./treqd.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Telemetry and observability configuration (OpenTelemetry metrics).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// OTLP endpoint for metrics export; metrics stay local when unset.
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enable: true, otlp_endpoint: None, otlp_headers: HashMap::new() }
    }
}

/// Root configuration for the treq server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the configuration from defaults, a TOML file, and `TREQ_`-prefixed
/// environment variables (e.g. `TREQ_SERVER__PORT=8080`).
///
/// # Errors
///
/// Returns an error if the configuration file exists but contains invalid
/// TOML, or if environment overrides fail to deserialize.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // Missing config file is fine; defaults + env cover the local case.
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("TREQ_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized,
/// which would indicate a programming error.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.address(), "127.0.0.1:4664");
        assert_eq!(config.limits.session_ttl_ms, 30 * 60 * 1000);
        assert_eq!(config.limits.event_replay_buffer_size, 500);
        assert_eq!(config.auth.script_token_ttl_ms, 15 * 60 * 1000);
        assert!(config.auth.token.is_none());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = generate_default().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, Config::default().server.port);
    }
}
