use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finagent_core::agent::{AgentEvent, FinancialAgent};
use finagent_core::config::{Settings, DEFAULT_ENV_FILE};
use finagent_core::llm::ark::ArkClient;
use finagent_core::session::{
    Session, SessionContext, SessionId, SessionNotFound, SessionStore, TitleGenerator, TurnRole,
};
use finagent_core::tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let env_file = std::env::var("FINAGENT_ENV_FILE").unwrap_or_else(|_| DEFAULT_ENV_FILE.to_string());
    dotenvy::from_path(&env_file).ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let model = Arc::new(ArkClient::chat_from_settings(&settings)?);
    let tools = ToolRegistry::from_settings(&settings, model.clone()).await?;
    tracing::info!(tools = ?tools.names(), model = %settings.ark_model_id.as_deref().unwrap_or_default(), "agent ready");

    let store = SessionStore::from_settings(&settings)?;
    let ctx = store.open_context();

    let state = Arc::new(AppState {
        agent: FinancialAgent::new(model, tools),
        titler: TitleGenerator::from_settings(&settings)?,
        store,
        session: Mutex::new(ctx),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(list_sessions))
        .route("/sessions/active", get(active_session))
        .route("/sessions/new", post(new_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/load", post(load_session))
        .route("/chat", post(chat))
        .with_state(state.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8501);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, history_dir = %state.store.dir().display(), policy = state.store.policy().as_str(), "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Keep the conversation that was open when the server stopped.
    let mut ctx = state.session.lock().await;
    if !ctx.active.is_empty() {
        if let Err(e) = state.store.finalize_and_rotate(&mut ctx, &state.titler).await {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "failed to save active session on shutdown");
        }
    }

    Ok(())
}

struct AppState {
    agent: FinancialAgent,
    titler: TitleGenerator,
    store: SessionStore,
    session: Mutex<SessionContext>,
}

async fn healthz() -> &'static str {
    "ok"
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %e, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn parse_id(raw: &str) -> Result<SessionId, StatusCode> {
    SessionId::parse(raw).map_err(|_| StatusCode::BAD_REQUEST)
}

/// Missing session file is the caller's mistake; anything else (malformed file, I/O)
/// is ours.
fn load_error_status(e: anyhow::Error) -> StatusCode {
    if e.downcast_ref::<SessionNotFound>().is_some() {
        return StatusCode::NOT_FOUND;
    }
    internal(e)
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SessionId>>, StatusCode> {
    state.store.list_sessions().map(Json).map_err(internal)
}

async fn active_session(State(state): State<Arc<AppState>>) -> Json<Session> {
    Json(state.session.lock().await.active.clone())
}

#[derive(Debug, Serialize)]
struct NewSessionResponse {
    id: SessionId,
}

async fn new_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<NewSessionResponse>, StatusCode> {
    let mut ctx = state.session.lock().await;
    let id = state
        .store
        .finalize_and_rotate(&mut ctx, &state.titler)
        .await
        .map_err(internal)?;
    Ok(Json(NewSessionResponse { id }))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, StatusCode> {
    let id = parse_id(&id)?;
    state.store.read_record(&id).map(Json).map_err(load_error_status)
}

async fn load_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, StatusCode> {
    let id = parse_id(&id)?;
    let mut ctx = state.session.lock().await;
    state
        .store
        .load(&mut ctx, &id)
        .map_err(load_error_status)?;
    Ok(Json(ctx.active.clone()))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let id = parse_id(&id)?;
    state.store.delete(&id).map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (tx, rx) = mpsc::channel::<TurnEvent>(64);
    tokio::spawn(run_chat_turn(state, message, tx));

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event.to_sse()), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// What one chat turn reports to the client, in order: statuses and deltas, then
/// exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TurnEvent {
    Status(String),
    Delta(String),
    Done { session_id: SessionId, answer: String },
    Error(String),
}

impl From<AgentEvent> for TurnEvent {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::Delta(text) => TurnEvent::Delta(text),
            other => TurnEvent::Status(other.status().unwrap_or_default()),
        }
    }
}

impl TurnEvent {
    fn to_sse(&self) -> Event {
        match self {
            TurnEvent::Status(text) => sse_json("status", json!({ "text": text })),
            TurnEvent::Delta(text) => sse_json("delta", json!({ "text": text })),
            TurnEvent::Done { session_id, answer } => {
                sse_json("done", json!({ "session_id": session_id, "answer": answer }))
            }
            TurnEvent::Error(message) => sse_json("error", json!({ "message": message })),
        }
    }
}

/// Runs one agent turn against the active session. Holds the session lock for the
/// whole turn, so a second concurrent message waits.
async fn run_chat_turn(state: Arc<AppState>, message: String, out: mpsc::Sender<TurnEvent>) {
    let mut ctx = state.session.lock().await;
    let history = ctx.active.turns.clone();
    let session_id = ctx.active.id.clone();

    if let Err(e) = state.store.append_turn(&mut ctx, TurnRole::User, &message) {
        let _ = out.send(TurnEvent::Error(format!("{e:#}"))).await;
        internal(e);
        return;
    }

    let (agent_tx, mut agent_rx) = mpsc::channel::<AgentEvent>(64);
    let forward = async {
        while let Some(event) = agent_rx.recv().await {
            // The browser may have gone away; the turn still completes and is stored.
            let _ = out.send(event.into()).await;
        }
    };
    let (result, ()) = tokio::join!(state.agent.respond(&history, &message, agent_tx), forward);

    let (answer, event) = match result {
        Ok(answer) => {
            let done = TurnEvent::Done {
                session_id,
                answer: answer.clone(),
            };
            (answer, done)
        }
        Err(e) => {
            let text = format!("Sorry, the request failed: {e:#}");
            let event = TurnEvent::Error(text.clone());
            internal(e);
            (text, event)
        }
    };

    if let Err(e) = state.store.append_turn(&mut ctx, TurnRole::Assistant, answer) {
        internal(e);
    }
    let _ = out.send(event).await;
}

// JSON payloads keep newlines and carriage returns inside a single `data:` line.
fn sse_json(name: &str, body: serde_json::Value) -> Event {
    Event::default()
        .event(name)
        .json_data(body)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, event = name, "failed to encode sse event");
            Event::default().event(name)
        })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
