//! # colloquy
//!
//! Command-line chat client: keeps persisted conversations with
//! OpenAI-compatible chat-completion endpoints and streams answers to the
//! terminal.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

use colloquy_core::events::GenerationEvent;
use colloquy_core::ids::ConversationId;
use colloquy_core::messages::{Attachment, Role};
use colloquy_core::provider::ChatProvider;
use colloquy_core::stream::Phase;
use colloquy_engine::{GenerationController, SessionHandle};
use colloquy_llm::{ModelJudge, ModelTitleGenerator, OpenAiCompatProvider, WebSearchClient};
use colloquy_settings::{data_dir, load_settings, ChatSettings, ModelRegistry};
use colloquy_store::{ConversationStore, Database, ExportDocument, KvStore, PreferencesRepo, SqliteKv};
use colloquy_telemetry::{init_telemetry, TelemetryConfig};

/// Chat with configured models from the terminal.
#[derive(Parser, Debug)]
#[command(name = "colloquy", about = "Streaming chat client for OpenAI-compatible endpoints")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new conversation and select it.
    New {
        /// Conversation category (a key of `chatTypes`).
        #[arg(long, default_value = "normal")]
        category: String,
    },
    /// List conversations, newest first, grouped by age.
    List,
    /// Print a conversation.
    Show {
        /// Conversation id; defaults to the current one.
        id: Option<String>,
        /// Only the last N messages.
        #[arg(long)]
        last: Option<usize>,
        /// Include reasoning output.
        #[arg(long)]
        thinking: bool,
    },
    /// Make a conversation current.
    Select { id: String },
    /// Delete a conversation.
    Delete { id: String },
    /// Send a message to the current conversation and stream the answer.
    Send {
        /// Message text.
        #[arg(required = true)]
        text: Vec<String>,
        /// Attach a text file; may be repeated.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Model id to use instead of the preferred one.
        #[arg(long)]
        model: Option<String>,
    },
    /// Replace the last answer of the current conversation.
    Regenerate {
        #[arg(long)]
        model: Option<String>,
    },
    /// Write a conversation to a JSON file.
    Export {
        id: Option<String>,
        /// Output directory.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Import a conversation from an exported JSON file.
    Import { path: PathBuf },
    /// List configured models, optionally choosing the preferred one.
    Models {
        #[arg(long)]
        prefer: Option<String>,
    },
}

/// Everything the commands need, wired from settings.
struct App {
    settings: ChatSettings,
    prefs: PreferencesRepo,
    store: Arc<ConversationStore>,
    provider: Arc<dyn ChatProvider>,
}

impl App {
    fn open() -> Result<Self> {
        let mut settings = load_settings().context("Failed to load settings")?;
        let dir = data_dir(&settings);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        let db_path = dir.join("colloquy.db");
        let db = Database::open(&db_path).context("Failed to open database")?;
        info!(path = %db_path.display(), "database opened");

        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::new(db));
        let prefs = PreferencesRepo::new(Arc::clone(&kv));
        prefs.apply(&mut settings)?;
        let store = Arc::new(ConversationStore::open(kv)?);
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiCompatProvider::new()?);

        Ok(Self {
            settings,
            prefs,
            store,
            provider,
        })
    }

    fn controller(&self) -> Result<GenerationController> {
        let registry = ModelRegistry::from_settings(&self.settings);
        let judge = ModelJudge::new(
            Arc::clone(&self.provider),
            registry.resolve(&self.settings.search_judger_model),
        );
        let titles = ModelTitleGenerator::new(
            Arc::clone(&self.provider),
            registry.resolve(&self.settings.title_generation_model),
        );
        let search = WebSearchClient::new(
            self.settings.search.url.as_str(),
            self.settings.search.token.as_str(),
            self.settings.search.enabled,
        )?;
        Ok(GenerationController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.provider),
            self.settings.clone(),
        )
        .with_search(Arc::new(judge), Arc::new(search))
        .with_titles(Arc::new(titles)))
    }

    fn resolve_id(&self, id: Option<&str>) -> Result<ConversationId> {
        match id {
            Some(raw) => {
                let id = ConversationId::from_raw(raw);
                if !self.store.contains(&id) {
                    bail!("no conversation with id {raw}");
                }
                Ok(id)
            }
            None => self
                .store
                .current_id()
                .context("no conversation selected; run `colloquy new`"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: if cli.verbose { Level::DEBUG } else { Level::WARN },
        json: cli.json_logs,
        ..TelemetryConfig::default()
    });

    let app = App::open()?;
    match cli.command {
        Command::New { category } => {
            let id = app.controller()?.new_conversation(&category)?;
            let conv = app.store.get(&id).context("conversation vanished")?;
            println!("{id}  {}", conv.title);
        }
        Command::List => list(&app),
        Command::Show { id, last, thinking } => show(&app, id.as_deref(), last, thinking)?,
        Command::Select { id } => {
            if !app.store.select(&ConversationId::from_raw(id.as_str()))? {
                bail!("no conversation with id {id}");
            }
        }
        Command::Delete { id } => {
            if !app.store.delete(&ConversationId::from_raw(id.as_str()))? {
                bail!("no conversation with id {id}");
            }
            if let Some(current) = app.store.current() {
                println!("current: {}  {}", current.id, current.title);
            }
        }
        Command::Send { text, files, model } => {
            let controller = app.controller()?;
            if let Some(model) = model {
                controller.set_model(&model)?;
            }
            if app.store.current_id().is_none() {
                let _ = controller.new_conversation("normal")?;
            }
            let attachments = files
                .iter()
                .map(|p| read_attachment(p))
                .collect::<Result<Vec<_>>>()?;
            let mut events = controller.subscribe();
            let handle = controller.send(&text.join(" "), &attachments)?;
            stream_to_terminal(&app, handle, &mut events).await?;
        }
        Command::Regenerate { model } => {
            let controller = app.controller()?;
            if let Some(model) = model {
                controller.set_model(&model)?;
            }
            let conv = app.store.current().context("no conversation selected")?;
            let index = conv.messages.len().checked_sub(1).context("conversation is empty")?;
            let mut events = controller.subscribe();
            let handle = controller.regenerate(index)?;
            stream_to_terminal(&app, handle, &mut events).await?;
        }
        Command::Export { id, out } => {
            let id = app.resolve_id(id.as_deref())?;
            let doc = app.store.export(&id)?;
            let path = out.join(doc.file_name());
            std::fs::write(&path, doc.to_json()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{}", path.display());
        }
        Command::Import { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let id = app.store.import(ExportDocument::parse(&text)?)?;
            println!("{id}");
        }
        Command::Models { prefer } => {
            let registry = ModelRegistry::from_settings(&app.settings);
            if let Some(id) = prefer {
                if !registry.contains(&id) {
                    bail!("model not configured: {id}");
                }
                app.prefs.set_preferred_model(&id)?;
                println!("preferred model: {id}");
                return Ok(());
            }
            for (id, cfg) in registry.list() {
                let marker = if id == app.settings.default_model { '*' } else { ' ' };
                println!("{marker} {id}  {}  ({:?})", cfg.name, cfg.kind);
            }
        }
    }
    Ok(())
}

fn list(app: &App) {
    let current = app.store.current_id();
    let now = chrono::Utc::now().timestamp_millis();
    for group in app.store.grouped(now) {
        println!("{}", group.bucket.label());
        for conv in group.items {
            let marker = if current.as_ref() == Some(&conv.id) { '*' } else { ' ' };
            println!("{marker} {}  {}  ({} messages)", conv.id, conv.title, conv.messages.len());
        }
    }
}

fn show(app: &App, id: Option<&str>, last: Option<usize>, thinking: bool) -> Result<()> {
    let id = app.resolve_id(id)?;
    let messages = match last {
        Some(n) => app.store.messages_for_context_of(&id, n),
        None => app.store.get(&id).map(|c| c.messages).unwrap_or_default(),
    };
    if let Some(conv) = app.store.get(&id) {
        println!("# {}\n", conv.title);
    }
    for msg in &messages {
        println!("[{}]", msg.role.as_str());
        if let Some(reasoning) = msg.body.thinking().filter(|_| thinking) {
            println!("(thinking) {reasoning}");
        }
        println!("{}", msg.text());
        if let Some(results) = &msg.search_results {
            println!("\n{results}");
        }
        println!();
    }
    Ok(())
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Attachment {
        file_name,
        mime_type: "text/plain".to_string(),
        size: content.len() as u64,
        content,
    })
}

/// Print deltas as they arrive (reasoning on stderr, answer on stdout)
/// until the session finishes. Ctrl+C stops the session.
async fn stream_to_terminal(
    app: &App,
    handle: SessionHandle,
    events: &mut tokio::sync::broadcast::Receiver<GenerationEvent>,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => handle.stop(),
            event = events.recv() => match event {
                Ok(GenerationEvent::ReasoningDelta { delta, .. }) => {
                    let _ = write!(stderr, "{delta}");
                }
                Ok(GenerationEvent::ContentDelta { delta, .. }) => {
                    write!(stdout, "{delta}")?;
                    stdout.flush()?;
                }
                Ok(GenerationEvent::Finished { .. }) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
            },
        }
    }
    println!();

    let conversation_id = handle.conversation_id().clone();
    match handle.wait().await? {
        Phase::Errored => {
            let text = app
                .store
                .get(&conversation_id)
                .and_then(|c| c.messages.last().map(|m| m.text().to_string()))
                .unwrap_or_default();
            bail!("{text}");
        }
        Phase::Aborted => eprintln!("(stopped)"),
        _ => {}
    }
    if let Some(conv) = app.store.get(&conversation_id) {
        if let Some(last) = conv.messages.last().filter(|m| m.role == Role::Assistant) {
            info!(conversation_id = %conv.id, chars = last.text().len(), title = %conv.title, "answer saved");
        }
    }
    Ok(())
}
