//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RecallSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `RECALL_*` environment overrides
//! 4. The binary applies command-line flags last

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, Level};

use recall_engine::{EngineConfig, DEFAULT_MAX_MODEL_CALLS};
use recall_llm::ProviderConfig;
use recall_server::ServerConfig;
use recall_telemetry::{recall_home, TelemetryConfig};

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

pub const API_KEY_ENV: &str = "RECALL_MODEL_API_KEY";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecallSettings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_body_mb: usize,
    pub request_timeout_secs: u64,
    /// Callers allowed to act for other users.
    pub assistant_user_ids: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            host: server.host,
            port: server.port,
            max_body_mb: server.max_body_bytes / (1024 * 1024),
            request_timeout_secs: server.request_timeout.as_secs(),
            assistant_user_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            timeout_secs: engine.model_timeout.as_secs(),
            temperature: engine.temperature,
            max_tokens: engine.max_tokens,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub max_model_calls: u32,
    pub tool_concurrency: usize,
    pub tool_timeout_secs: u64,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_model_calls: engine.max_model_calls,
            tool_concurrency: engine.tool_concurrency,
            tool_timeout_secs: engine.tool_timeout.as_secs(),
            history_limit: engine.history_limit,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-module overrides, e.g. `{"recall_llm": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub persist_to_sqlite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// Days persisted warnings and errors are kept.
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            modules: BTreeMap::new(),
            persist_to_sqlite: true,
            db_path: None,
            retention_days: 14,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Conversation database. Defaults to `~/.recall/database/recall.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl RecallSettings {
    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=DEFAULT_MAX_MODEL_CALLS).contains(&self.engine.max_model_calls) {
            return Err(SettingsError::InvalidValue(format!(
                "engine.maxModelCalls must be between 1 and {DEFAULT_MAX_MODEL_CALLS}"
            )));
        }
        if self.engine.tool_concurrency == 0 {
            return Err(SettingsError::InvalidValue("engine.toolConcurrency must be at least 1".into()));
        }
        if self.model.timeout_secs == 0 || self.engine.tool_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue("timeouts must be at least 1 second".into()));
        }
        if self.model.base_url.trim().is_empty() || self.model.model.trim().is_empty() {
            return Err(SettingsError::InvalidValue("model.baseUrl and model.model are required".into()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_model_calls: self.engine.max_model_calls,
            model_timeout: Duration::from_secs(self.model.timeout_secs),
            temperature: self.model.temperature,
            max_tokens: self.model.max_tokens,
            tool_concurrency: self.engine.tool_concurrency,
            tool_timeout: Duration::from_secs(self.engine.tool_timeout_secs),
            history_limit: self.engine.history_limit,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            max_body_bytes: self.server.max_body_mb.saturating_mul(1024 * 1024),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            assistant_user_ids: self.server.assistant_user_ids.clone(),
        }
    }

    pub fn provider_config(&self, api_key: Option<SecretString>) -> ProviderConfig {
        ProviderConfig {
            base_url: self.model.base_url.clone(),
            model: self.model.model.clone(),
            api_key,
        }
    }

    pub fn telemetry_config(&self) -> Result<TelemetryConfig> {
        let log_level = parse_level(&self.logging.level)?;
        let module_levels = self
            .logging
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
            .collect::<Result<Vec<_>>>()?;

        let defaults = TelemetryConfig::default();
        Ok(TelemetryConfig {
            log_level,
            module_levels,
            log_to_sqlite: self.logging.persist_to_sqlite,
            log_db_path: self.logging.db_path.clone().unwrap_or(defaults.log_db_path),
            log_retention: Duration::from_secs(u64::from(self.logging.retention_days) * 24 * 60 * 60),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| recall_home().join("database").join("recall.db"))
    }
}

fn parse_level(raw: &str) -> Result<Level> {
    Level::from_str(raw.trim()).map_err(|_| SettingsError::InvalidValue(format!("unknown log level: {raw}")))
}

/// Resolve the path to the settings file (`~/.recall/settings.json`).
pub fn settings_path() -> PathBuf {
    recall_home().join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RecallSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<RecallSettings> {
    let defaults = serde_json::to_value(RecallSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RECALL_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut RecallSettings, env: impl Fn(&str) -> Option<String>) {
    let env = EnvReader(env);

    if let Some(v) = env.string("RECALL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("RECALL_PORT", 1u16, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("RECALL_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = env.string("RECALL_MODEL_BASE_URL") {
        settings.model.base_url = v;
    }
    if let Some(v) = env.parsed("RECALL_MAX_MODEL_CALLS", 1u32, DEFAULT_MAX_MODEL_CALLS) {
        settings.engine.max_model_calls = v;
    }
    if let Some(v) = env.parsed("RECALL_TOOL_CONCURRENCY", 1usize, 64) {
        settings.engine.tool_concurrency = v;
    }
    if let Some(v) = env.string("RECALL_DB_PATH") {
        settings.storage.db_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env.string("RECALL_LOG_LEVEL") {
        if parse_level(&v).is_ok() {
            settings.logging.level = v;
        } else {
            tracing::warn!(key = "RECALL_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
}

/// Model API key. Only ever read from the environment.
pub fn api_key_from_env() -> Option<SecretString> {
    std::env::var(API_KEY_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

/// Parse a string as a number within an inclusive range.
pub fn parse_range<T: FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr + PartialOrd + Copy>(&self, name: &str, min: T, max: T) -> Option<T> {
        let val = self.string(name)?;
        let result = parse_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
