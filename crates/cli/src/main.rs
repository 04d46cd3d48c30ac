use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finagent_core::agent::{AgentEvent, FinancialAgent};
use finagent_core::config::{Settings, DEFAULT_ENV_FILE};
use finagent_core::llm::ark::ArkClient;
use finagent_core::market::MarketDataResolver;
use finagent_core::session::{
    ChatTurn, SessionContext, SessionId, SessionStore, TitleGenerator, TurnRole,
};
use finagent_core::tools::ToolRegistry;

#[derive(Debug, Parser)]
#[command(name = "finagent", about = "Financial assistant: price lookups and chat")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print daily bars for a symbol, trying each data source in turn.
    Quote {
        /// Ticker, e.g. 600519, 000001.SZ or AAPL.
        #[arg(long)]
        symbol: String,
        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,
        /// End date (YYYY-MM-DD). Defaults to today's CST date.
        #[arg(long)]
        end: Option<String>,
    },
    /// Ask one question and stream the answer.
    Ask { question: String },
    /// Interactive chat with session history.
    Chat,
    /// Manage stored sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsAction {
    List,
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let env_file = std::env::var("FINAGENT_ENV_FILE").unwrap_or_else(|_| DEFAULT_ENV_FILE.to_string());
    dotenvy::from_path(&env_file).ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Quote { symbol, start, end } => quote(&settings, &symbol, &start, end).await,
        Command::Ask { question } => ask(&settings, &question).await,
        Command::Chat => chat(&settings).await,
        Command::Sessions { action } => sessions(&settings, action),
    };

    if let Err(e) = &result {
        sentry_anyhow::capture_anyhow(e);
    }
    result
}

async fn quote(
    settings: &Settings,
    symbol: &str,
    start: &str,
    end: Option<String>,
) -> anyhow::Result<()> {
    let end = match end {
        Some(end) => end,
        None => finagent_core::time::today_cst(chrono::Utc::now())?.to_string(),
    };
    let resolver = MarketDataResolver::from_settings(settings)?;
    tracing::info!(sources = ?resolver.source_names(), %symbol, "quote");
    println!("{}", resolver.fetch(symbol, start, &end).await);
    Ok(())
}

async fn build_agent(settings: &Settings) -> anyhow::Result<FinancialAgent> {
    let model = Arc::new(ArkClient::chat_from_settings(settings)?);
    let tools = ToolRegistry::from_settings(settings, model.clone()).await?;
    Ok(FinancialAgent::new(model, tools))
}

async fn ask(settings: &Settings, question: &str) -> anyhow::Result<()> {
    let agent = build_agent(settings).await?;
    answer_turn(&agent, &[], question).await?;
    Ok(())
}

/// Runs one agent turn, printing status lines to stderr and the answer to stdout.
async fn answer_turn(
    agent: &FinancialAgent,
    history: &[ChatTurn],
    input: &str,
) -> anyhow::Result<String> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
    let render = async {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Delta(text) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                other => {
                    if let Some(status) = other.status() {
                        eprintln!("[{status}]");
                    }
                }
            }
        }
        println!();
    };
    let (answer, ()) = tokio::join!(agent.respond(history, input, tx), render);
    answer
}

async fn chat(settings: &Settings) -> anyhow::Result<()> {
    let store = SessionStore::from_settings(settings)?;
    let mut repl = Repl {
        agent: build_agent(settings).await?,
        titler: TitleGenerator::from_settings(settings)?,
        ctx: store.open_context(),
        store,
    };

    eprintln!("Session {} (/new, /load <id>, /list, /delete <id>, /quit)", repl.ctx.active.id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        let _ = std::io::stderr().flush();
        let line = match lines.next_line().await.context("failed to read stdin") {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed unexpectedly");
                break;
            }
        };
        let Some(cmd) = ReplCommand::parse(&line) else {
            continue;
        };
        if cmd == ReplCommand::Quit {
            break;
        }
        if let Err(e) = repl.handle(cmd).await {
            eprintln!("Error: {e:#}");
        }
    }

    repl.finish().await
}

/// One line typed at the chat prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplCommand<'a> {
    Quit,
    New,
    List,
    Load(&'a str),
    Delete(&'a str),
    Message(&'a str),
}

impl<'a> ReplCommand<'a> {
    /// `None` for a blank line. Unknown `/words` are sent to the agent as text.
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (cmd, arg) = line
            .split_once(char::is_whitespace)
            .map(|(c, a)| (c, a.trim()))
            .unwrap_or((line, ""));
        Some(match cmd {
            "/quit" | "/exit" => Self::Quit,
            "/new" => Self::New,
            "/list" => Self::List,
            "/load" => Self::Load(arg),
            "/delete" => Self::Delete(arg),
            _ => Self::Message(line),
        })
    }
}

struct Repl {
    agent: FinancialAgent,
    titler: TitleGenerator,
    store: SessionStore,
    ctx: SessionContext,
}

impl Repl {
    /// Errors leave the active session intact; the caller reports them and keeps reading.
    async fn handle(&mut self, cmd: ReplCommand<'_>) -> anyhow::Result<()> {
        match cmd {
            ReplCommand::Quit => {}
            ReplCommand::New => {
                let id = self.store.finalize_and_rotate(&mut self.ctx, &self.titler).await?;
                eprintln!("Started session {id}");
            }
            ReplCommand::List => print_sessions(&self.store)?,
            ReplCommand::Load(arg) => {
                let id = SessionId::parse(arg)?;
                self.store
                    .load(&mut self.ctx, &id)
                    .with_context(|| format!("could not load {id}"))?;
                for turn in &self.ctx.active.turns {
                    println!("{}: {}", turn.role.as_str(), turn.content);
                }
                eprintln!("Loaded session {id}");
            }
            ReplCommand::Delete(arg) => {
                let id = SessionId::parse(arg)?;
                self.store.delete(&id)?;
                eprintln!("Deleted {id}");
            }
            ReplCommand::Message(text) => {
                let history = self.ctx.active.turns.clone();
                self.store.append_turn(&mut self.ctx, TurnRole::User, text)?;
                let answer = match answer_turn(&self.agent, &history, text).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        sentry_anyhow::capture_anyhow(&e);
                        let reply = format!("Sorry, the request failed: {e:#}");
                        println!("{reply}");
                        reply
                    }
                };
                self.store.append_turn(&mut self.ctx, TurnRole::Assistant, answer)?;
            }
        }
        Ok(())
    }

    /// Saves the active session when it has turns.
    async fn finish(&mut self) -> anyhow::Result<()> {
        if self.ctx.active.is_empty() {
            return Ok(());
        }
        let id = self.ctx.active.id.clone();
        self.store.finalize_and_rotate(&mut self.ctx, &self.titler).await?;
        eprintln!("Saved session {id}");
        Ok(())
    }
}

fn sessions(settings: &Settings, action: SessionsAction) -> anyhow::Result<()> {
    let store = SessionStore::from_settings(settings)?;
    match action {
        SessionsAction::List => print_sessions(&store),
        SessionsAction::Delete { id } => store.delete(&SessionId::parse(&id)?),
    }
}

fn print_sessions(store: &SessionStore) -> anyhow::Result<()> {
    for id in store.list_sessions()? {
        let title = match store.read_record(&id) {
            Ok(session) => session.title.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "unreadable session file");
                "<unreadable>".to_string()
            }
        };
        println!("{id}\t{title}");
    }
    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
