use crate::config::Settings;
use crate::session::title::TitleGenerator;
use crate::session::{
    ChatTurn, PersistPolicy, Session, SessionContext, SessionId, SessionRecord, StoredSession,
    TurnRole,
};
use anyhow::Context;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Returned (inside `anyhow::Error`) when a session id has no file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotFound(pub SessionId);

impl fmt::Display for SessionNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} not found", self.0)
    }
}

impl std::error::Error for SessionNotFound {}

/// Flat directory of `{id}.json` session files.
///
/// Writes are whole-file overwrites. A file that cannot be parsed is reported as
/// an error on load and skipped by nothing else.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    policy: PersistPolicy,
}

impl SessionStore {
    pub fn open(dir: impl Into<PathBuf>, policy: PersistPolicy) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create history dir {}", dir.display()))?;
        Ok(Self { dir, policy })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Self::open(&settings.history_dir, settings.persist_policy)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    fn path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Replaces the active session with an empty one. Nothing is written.
    pub fn new_session(&self, ctx: &mut SessionContext) -> SessionId {
        let id = self.unused_id();
        tracing::debug!(session_id = %id, "new session");
        ctx.active = Session::new(id.clone());
        id
    }

    /// Context for a new client, starting on an empty session. Nothing is written.
    pub fn open_context(&self) -> SessionContext {
        let id = self.unused_id();
        tracing::debug!(session_id = %id, "new session");
        SessionContext::new(id)
    }

    fn unused_id(&self) -> SessionId {
        loop {
            let id = SessionId::generate();
            if !self.path(&id).exists() {
                return id;
            }
        }
    }

    pub fn append_turn(
        &self,
        ctx: &mut SessionContext,
        role: TurnRole,
        content: impl Into<String>,
    ) -> anyhow::Result<()> {
        ctx.active.turns.push(ChatTurn {
            role,
            content: content.into(),
        });
        match self.policy {
            PersistPolicy::OnFinalize => Ok(()),
            PersistPolicy::EveryTurn => self.save_unfinalized(&ctx.active),
        }
    }

    /// Titles and writes the active session (if it has turns), then starts a new one.
    pub async fn finalize_and_rotate(
        &self,
        ctx: &mut SessionContext,
        titler: &TitleGenerator,
    ) -> anyhow::Result<SessionId> {
        if !ctx.active.is_empty() {
            let title = titler.generate(&ctx.active.turns).await;
            ctx.active.title = Some(title);
            self.write(&ctx.active)?;
            tracing::info!(
                session_id = %ctx.active.id,
                turns = ctx.active.turns.len(),
                title = ctx.active.title.as_deref().unwrap_or_default(),
                "session finalized"
            );
        }
        Ok(self.new_session(ctx))
    }

    /// Saves the outgoing session as-is, then makes `id` the active session.
    /// Fails with [`SessionNotFound`] when `id` has no file.
    pub fn load(&self, ctx: &mut SessionContext, id: &SessionId) -> anyhow::Result<()> {
        self.save_unfinalized(&ctx.active)?;
        let session = self.read_record(id)?;
        tracing::info!(
            from = %ctx.active.id,
            to = %session.id,
            turns = session.turns.len(),
            "session loaded"
        );
        ctx.active = session;
        Ok(())
    }

    /// Removes the file for `id`; a missing file is fine. The active session is
    /// left alone even when it has the same id.
    pub fn delete(&self, id: &SessionId) -> anyhow::Result<()> {
        let path = self.path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(session_id = %id, "session deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete {}", path.display()))
            }
        }
    }

    /// Stored session ids, most recent first.
    pub fn list_sessions(&self) -> anyhow::Result<Vec<SessionId>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read history dir {}", self.dir.display()))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.context("failed to read history dir entry")?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = SessionId::parse(stem) {
                ids.push(id);
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Reads a stored session without touching the active one.
    pub fn read_record(&self, id: &SessionId) -> anyhow::Result<Session> {
        let path = self.path(id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SessionNotFound(id.clone()).into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let stored: StoredSession = serde_json::from_str(&text)
            .with_context(|| format!("malformed session file {}", path.display()))?;
        let (title, turns) = stored.into_parts();
        Ok(Session {
            id: id.clone(),
            title,
            turns,
        })
    }

    /// Write without computing a title: keeps whatever title the session already has.
    fn save_unfinalized(&self, session: &Session) -> anyhow::Result<()> {
        if session.is_empty() {
            return Ok(());
        }
        self.write(session)
    }

    fn write(&self, session: &Session) -> anyhow::Result<()> {
        let record = SessionRecord {
            title: session.title.clone().unwrap_or_default(),
            messages: session.turns.clone(),
        };
        let body = serde_json::to_string_pretty(&record).context("failed to encode session")?;
        let path = self.path(&session.id);
        std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }
}
