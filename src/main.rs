mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use recall_engine::{Orchestrator, ToolRegistry};
use recall_llm::OpenAiCompatProvider;
use recall_store::{Database, SqliteConversationStore};

#[derive(Debug, Parser)]
#[command(name = "recall", version, about = "Prompt orchestration server for the Recall assistant")]
struct Cli {
    /// Settings file. Defaults to ~/.recall/settings.json.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Conversation database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print the warnings and errors persisted for a request id, then exit.
    #[arg(long, value_name = "REQUEST_ID")]
    incidents: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut settings::RecallSettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.storage.db_path = Some(db.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.settings.clone().unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate()?;

    if let Some(request_id) = &cli.incidents {
        return print_incidents(&settings.telemetry_config()?, request_id);
    }

    let _telemetry = recall_telemetry::init_telemetry(settings.telemetry_config()?);
    tracing::info!(settings = %path.display(), "Starting Recall server");

    let db_path = settings.database_path();
    let db = Database::open(&db_path).context("failed to open database")?;

    let api_key = settings::api_key_from_env();
    if api_key.is_none() {
        tracing::warn!(env = settings::API_KEY_ENV, "no model API key configured");
    }
    let provider = OpenAiCompatProvider::new(settings.provider_config(api_key))
        .context("failed to build model provider")?;

    let engine_config = settings.engine_config();
    let tools = ToolRegistry::new().with_timeout(engine_config.tool_timeout);
    tracing::info!(tools = tools.count(), model = %settings.model.model, "engine configured");

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(provider),
        Arc::new(tools),
        Arc::new(SqliteConversationStore::new(db)),
        engine_config,
    ));

    let handle = recall_server::start(settings.server_config(), orchestrator)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "Recall server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn print_incidents(config: &recall_telemetry::TelemetryConfig, request_id: &str) -> anyhow::Result<()> {
    let sink = recall_telemetry::SqliteLogSink::new(&config.log_db_path)
        .with_context(|| format!("failed to open log database {}", config.log_db_path.display()))?;
    for record in sink.request_log(request_id).context("failed to read log records")? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
