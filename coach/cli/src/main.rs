//! Coach CLI - Terminal Chat for Coachline
//!
//! A line-oriented surface over the coach-core conversation engine: chat
//! with a coaching persona, and list or inspect saved sessions.
//!
//! # Usage
//!
//! ```bash
//! # Chat against the configured coaching API
//! coach
//!
//! # Offline, with canned replies
//! coach --offline --persona direct-challenger
//!
//! # Resume a saved session
//! coach chat --resume 6f1c...
//!
//! # Saved sessions
//! coach sessions list
//! coach sessions show 6f1c...
//!
//! # Verbose logging (to stderr)
//! RUST_LOG=coach_core=debug coach --offline
//! ```

mod chat;
mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coach_core::backend::{CoachingBackend, HttpBackend, InMemoryBackend, StreamTransport};
use coach_core::config::{default_config_path, load_config_from_path, CoachConfig};
use coach_core::session::format_elapsed;
use coach_core::{
    ConfigOverrides, ControllerConfig, JsonFileStore, MemoryStore, Persona, SessionController,
    SessionId, SessionStore, SessionType,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use chat::{Opening, StartParams};
use render::Renderer;

/// Pause between tokens of canned replies
const OFFLINE_TOKEN_DELAY: Duration = Duration::from_millis(40);

/// Coach - chat with a Coachline coaching persona
#[derive(Parser, Debug)]
#[command(name = "coach")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "COACH_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Use built-in canned replies instead of the coaching API
    #[arg(long, global = true)]
    offline: bool,

    /// Coaching API base URL
    #[arg(long, value_name = "URL", global = true)]
    api_url: Option<String>,

    /// Coach persona (direct-challenger, supportive-strategist)
    #[arg(short = 'p', long, global = true)]
    persona: Option<Persona>,

    /// Session type (check-in, deep-dive, goal-review, freeform)
    #[arg(short = 't', long, global = true)]
    session_type: Option<SessionType>,

    /// Participant identifier
    #[arg(long, value_name = "ID", global = true)]
    participant: Option<String>,

    /// Directory for saved sessions
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with the coach (default)
    Chat {
        /// Resume a saved session instead of starting one
        #[arg(long, value_name = "SESSION_ID")]
        resume: Option<String>,
    },
    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    /// List saved sessions, newest first
    List,
    /// Print a saved session's transcript
    Show {
        /// Session ID
        id: String,
    },
    /// Delete a saved session
    Delete {
        /// Session ID
        id: String,
    },
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(url) = &self.api_url {
            overrides = overrides.with_api_url(url.clone());
        }
        if let Some(persona) = self.persona {
            overrides = overrides.with_persona(persona);
        }
        if let Some(dir) = &self.data_dir {
            overrides = overrides.with_data_dir(dir.clone());
        }
        overrides.participant_id.clone_from(&self.participant);
        overrides.session_type = self.session_type;
        overrides
    }
}

/// Logs go to stderr so they never interleave with the transcript
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coach_cli=info,coach_core=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load_config(args: &Args) -> Result<CoachConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    info!(
        source = %config.source(),
        file = ?config.config_file_path,
        api_url = %config.backend.api_url,
        "Configuration loaded"
    );
    Ok(config)
}

fn open_store(config: &CoachConfig) -> Arc<dyn SessionStore> {
    match config.storage.data_dir.clone().or_else(JsonFileStore::default_dir) {
        Some(dir) => {
            info!(dir = ?dir, "Saving sessions to disk");
            Arc::new(JsonFileStore::new(dir))
        }
        None => {
            warn!("No data directory; sessions are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    }
}

fn open_backend(
    args: &Args,
    config: &CoachConfig,
) -> Result<(Arc<dyn CoachingBackend>, Arc<dyn StreamTransport>)> {
    if args.offline {
        info!("Offline mode: canned replies");
        let shared = Arc::new(InMemoryBackend::new().with_token_delay(OFFLINE_TOKEN_DELAY));
        let backend: Arc<dyn CoachingBackend> = shared.clone();
        let transport: Arc<dyn StreamTransport> = shared;
        return Ok((backend, transport));
    }
    let shared = Arc::new(
        HttpBackend::from_config(&config.backend).context("Failed to create HTTP backend")?,
    );
    let backend: Arc<dyn CoachingBackend> = shared.clone();
    let transport: Arc<dyn StreamTransport> = shared;
    Ok((backend, transport))
}

/// Keep the live channel open alongside the chat, logging its state
#[cfg(feature = "websocket")]
fn start_live_connection(config: &CoachConfig) -> Option<coach_core::ConnectionManager> {
    use coach_core::connection::WebSocketConnector;
    use coach_core::{ConnectionEvent, ConnectionManager};

    let url = config.connection.ws_url.clone()?;
    let manager = ConnectionManager::with_config(
        Arc::new(WebSocketConnector::new(url)),
        config.connection.heartbeat.clone(),
        config.connection.reconnect.clone(),
    );
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => info!("Live connection up"),
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    warn!(attempt, delay_secs = delay.as_secs(), "Live connection lost, retrying");
                }
                ConnectionEvent::Disconnected { error: Some(error) } => {
                    warn!(error = %error, "Live connection dropped");
                }
                _ => {}
            }
        }
    });
    manager.connect();
    Some(manager)
}

async fn run_chat(args: &Args, config: &CoachConfig, resume: Option<String>) -> Result<()> {
    let (backend, transport) = open_backend(args, config)?;
    let store = open_store(config);
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(backend, transport, store, tx)
        .with_config(ControllerConfig::from(&config.session));

    #[cfg(feature = "websocket")]
    let live = start_live_connection(config);

    let session = &config.session;
    let opening = resume.map_or(Opening::New, |id| Opening::Resume(SessionId::from(id.as_str())));
    let result = chat::run(
        controller,
        rx,
        Renderer::new(session.persona),
        opening,
        StartParams {
            participant_id: session.participant_id.clone(),
            persona: session.persona,
            session_type: session.session_type,
        },
    )
    .await;

    #[cfg(feature = "websocket")]
    if let Some(manager) = live {
        manager.disconnect();
    }
    result
}

async fn run_sessions(config: &CoachConfig, action: SessionsCommand) -> Result<()> {
    let store = open_store(config);
    match action {
        SessionsCommand::List => {
            let sessions = store.list().await?;
            if sessions.is_empty() {
                println!("No saved sessions.");
            }
            for s in sessions {
                let state = if s.is_active() { "active" } else { "ended" };
                println!(
                    "{}  {}  {:<12} {:<22} {:>3} msgs  {state}",
                    s.id,
                    s.started_at.format("%Y-%m-%d %H:%M"),
                    s.session_type,
                    s.persona.display_name(),
                    s.message_count,
                );
            }
        }
        SessionsCommand::Show { id } => {
            let id = SessionId::from(id.as_str());
            let (session, messages) = store
                .load(&id)
                .await?
                .with_context(|| format!("No saved session {id}"))?;
            println!(
                "{} with {} on {}",
                session.session_type,
                session.persona.display_name(),
                session.started_at.format("%Y-%m-%d %H:%M")
            );
            if let Some(duration) = session.duration_seconds {
                println!("Duration {}", format_elapsed(duration));
            }
            if let Some(summary) = &session.summary {
                println!("Summary: {summary}");
            }
            println!();
            for message in messages {
                println!(
                    "[{}] {:?}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    message.role,
                    message.content
                );
            }
        }
        SessionsCommand::Delete { id } => {
            store.delete(&SessionId::from(id.as_str())).await?;
            println!("Deleted {id}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    init_logging();

    let config = load_config(&args)?;
    match args.command.take() {
        None => run_chat(&args, &config, None).await,
        Some(Command::Chat { resume }) => run_chat(&args, &config, resume).await,
        Some(Command::Sessions { action }) => run_sessions(&config, action).await,
    }
}
