mod logging;

pub use logging::{LogQuery, LogRecord, Severity, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "recall_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Persisted records older than this are pruned at startup.
    pub log_retention: Duration,
}

/// Default retention for persisted warnings and errors.
pub const DEFAULT_LOG_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: recall_home().join("database/logs.db"),
            log_retention: DEFAULT_LOG_RETENTION,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,recall_llm=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    // JSON formatting layer for stdout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                if let Err(e) = sink.prune_older_than(config.log_retention) {
                    eprintln!("recall-telemetry: failed to prune log DB: {e}");
                }
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("recall-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    TelemetryGuard { log_sink: sqlite_sink }
}

/// `~/.recall`, falling back to `/tmp/.recall` when HOME is unset.
pub fn recall_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".recall")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("recall_llm".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn,recall_llm=debug");
    }

    #[test]
    fn default_log_path_under_recall_home() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.starts_with(recall_home()));
        assert!(config.log_to_sqlite);
        assert_eq!(config.log_retention, DEFAULT_LOG_RETENTION);
    }
}
