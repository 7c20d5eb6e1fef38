//! # scribe
//!
//! Editorial assistant binary: wires the provider, store, agent team and
//! session driver together, then either serves HTTP or runs one turn in the
//! terminal.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use scribe_core::events::{AgentRole, ToolCallPhase, TurnEvent};
use scribe_core::ids::ThreadId;
use scribe_core::provider::{LlmProvider, StreamOptions};
use scribe_engine::tools::create_default_registry;
use scribe_engine::{AutoApprove, DriverConfig, SessionDriver, Supervisor, SupervisorConfig, Team, TurnRequest};
use scribe_llm::{OpenAiProvider, ProviderConfig, ReliableConfig, ReliableProvider};
use scribe_server::{AppState, ServerConfig};
use scribe_store::{open_store, StoreConfig};
use scribe_telemetry::{init_telemetry, TelemetryConfig};

/// Multi-agent writing assistant.
#[derive(Parser, Debug)]
#[command(name = "scribe", about = "Supervisor, writer and reviewer agents behind one chat stream")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default).
    Serve,
    /// Run one turn and print the conversation.
    Ask {
        query: String,
        #[arg(long, default_value = "team_thread_001")]
        thread_id: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreKind {
    Sqlite,
    Memory,
}

#[derive(clap::Args, Debug)]
struct Settings {
    /// Chat model name.
    #[arg(long, env = "MODEL_NAME", default_value = scribe_llm::openai::DEFAULT_MODEL, global = true)]
    model: String,

    #[arg(long, env = "DASHSCOPE_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// OpenAI-compatible endpoint.
    #[arg(long, env = "DASHSCOPE_BASE_URL", default_value = scribe_llm::openai::DEFAULT_BASE_URL, global = true)]
    base_url: String,

    #[arg(long, env = "SCRIBE_HOST", default_value = "0.0.0.0", global = true)]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "SCRIBE_PORT", default_value_t = 8000, global = true)]
    port: u16,

    #[arg(long, env = "SCRIBE_STORE", value_enum, default_value = "sqlite", global = true)]
    store: StoreKind,

    /// Path to the SQLite conversation database.
    #[arg(long, env = "SCRIBE_DB_PATH", default_value = "memory.sqlite", global = true)]
    db_path: PathBuf,

    #[arg(
        long,
        env = "SCRIBE_WORKER_TIMEOUT_SECS",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    worker_timeout_secs: u64,

    #[arg(
        long,
        env = "SCRIBE_TOOL_TIMEOUT_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    tool_timeout_secs: u64,

    /// Delegations allowed per turn.
    #[arg(long, env = "SCRIBE_MAX_STEPS", default_value_t = 8, global = true)]
    max_steps: u32,

    /// Hide tool-call progress frames from chat streams.
    #[arg(long, global = true)]
    no_tool_events: bool,

    #[arg(long, env = "SCRIBE_LOG_JSON", global = true)]
    log_json: bool,
}

impl Settings {
    fn store_config(&self) -> StoreConfig {
        match self.store {
            StoreKind::Sqlite => StoreConfig::sqlite(&self.db_path),
            StoreKind::Memory => StoreConfig::memory(),
        }
    }

    fn provider_config(&self) -> Result<ProviderConfig> {
        let key = self
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context("DASHSCOPE_API_KEY is not set")?;
        let mut config = ProviderConfig::new(SecretString::from(key));
        config.base_url = self.base_url.clone();
        config.model = self.model.clone();
        Ok(config)
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_delegation_steps: self.max_steps,
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            stream_options: StreamOptions::with_temperature(0.7),
            ..SupervisorConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            forward_tool_events: !self.no_tool_events,
        }
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_driver(settings: &Settings) -> Result<Arc<SessionDriver>> {
    if matches!(settings.store, StoreKind::Sqlite) {
        ensure_parent_dir(&settings.db_path)?;
    }
    let store = open_store(&settings.store_config()).context("Failed to open conversation store")?;

    let inner = OpenAiProvider::new(settings.provider_config()?).context("Failed to build model client")?;
    let provider: Arc<dyn LlmProvider> =
        Arc::new(ReliableProvider::new(Arc::new(inner), ReliableConfig::default()));

    let config = settings.supervisor_config();
    let registry = create_default_registry();
    let team = Team::from_provider(
        Arc::clone(&provider),
        &registry,
        Arc::new(AutoApprove),
        config.stream_options.clone(),
    );
    let supervisor = Supervisor::new(provider, team, &registry, store, config);
    Ok(Arc::new(SessionDriver::new(Arc::new(supervisor), DriverConfig::default())))
}

async fn serve(settings: &Settings, driver: Arc<SessionDriver>) -> Result<()> {
    let config = settings.server_config();
    let state = AppState::new(driver, &config);
    let shutdown = CancellationToken::new();
    let handle = scribe_server::start(config, state, shutdown.clone())
        .await
        .context("Failed to start server")?;

    tracing::info!(addr = %handle.addr, model = %settings.model, "scribe ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    shutdown.cancel();

    handle
        .join
        .await
        .context("Server task panicked")?
        .context("Server error")?;
    Ok(())
}

/// Console transcript: a speaker label on every change of speaker, then
/// that speaker's text.
#[derive(Default)]
struct Transcript {
    speaker: Option<AgentRole>,
}

impl Transcript {
    fn say(&mut self, role: AgentRole, text: &str) -> std::io::Result<()> {
        let mut out = std::io::stdout();
        if self.speaker != Some(role) {
            if self.speaker.is_some() {
                writeln!(out)?;
            }
            writeln!(out, "[{role}]")?;
            self.speaker = Some(role);
        }
        write!(out, "{text}")?;
        out.flush()
    }

    fn finish(&self) -> std::io::Result<()> {
        writeln!(std::io::stdout())
    }
}

async fn ask(driver: Arc<SessionDriver>, query: String, thread_id: String) -> Result<()> {
    let mut stream = driver.open_stream(TurnRequest::new(query, ThreadId::from_raw(thread_id)));
    let mut transcript = Transcript::default();

    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::ContentDelta { text } => transcript.say(AgentRole::Supervisor, &text)?,
            TurnEvent::ToolCallDelta(meta) => match (meta.agent, meta.phase) {
                (AgentRole::Supervisor, _) => {}
                (role, ToolCallPhase::Progress) => {
                    transcript.say(role, meta.detail.as_deref().unwrap_or_default())?
                }
                (role, ToolCallPhase::Started) => {
                    transcript.say(role, &format!("(calling {})\n", meta.name))?
                }
                _ => {}
            },
            TurnEvent::Error { message } => {
                transcript.finish()?;
                anyhow::bail!(message);
            }
            TurnEvent::End => transcript.finish()?,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings;

    let command = cli.command.unwrap_or(Command::Serve);

    // Keep the console transcript readable.
    let log_level = match command {
        Command::Ask { .. } => Level::WARN,
        Command::Serve => Level::INFO,
    };
    init_telemetry(&TelemetryConfig {
        log_level,
        json: settings.log_json,
        ..TelemetryConfig::default()
    });

    let driver = build_driver(&settings)?;
    match command {
        Command::Serve => serve(&settings, driver).await,
        Command::Ask { query, thread_id } => ask(driver, query, thread_id).await,
    }
}
