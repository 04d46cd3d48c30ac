//! Chat sessions: the active conversation kept in memory, finalized conversations
//! kept as one JSON file each.

pub mod store;
pub mod title;

pub use store::{SessionNotFound, SessionStore};
pub use title::TitleGenerator;

use crate::llm::ChatMessage;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&ChatTurn> for ChatMessage {
    fn from(turn: &ChatTurn) -> Self {
        match turn.role {
            TurnRole::User => ChatMessage::user(turn.content.clone()),
            TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
        }
    }
}

const ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

// Last timestamp handed out and how many ids already used it.
static LAST_ISSUED: Mutex<(String, u32)> = Mutex::new((String::new(), 0));

/// Creation-time session id (`2024-05-01_09-30-00`). Ids sort lexicographically
/// in creation order; later ids within the same second get a zero-padded `-NN` suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self::issue(&LAST_ISSUED, Local::now())
    }

    fn issue(last_issued: &Mutex<(String, u32)>, at: DateTime<Local>) -> Self {
        let base = at.format(ID_FORMAT).to_string();
        let mut last = last_issued.lock().unwrap_or_else(|e| e.into_inner());
        if last.0 == base {
            last.1 += 1;
            Self(format!("{base}-{:02}", last.1))
        } else {
            *last = (base.clone(), 0);
            Self(base)
        }
    }

    /// Accepts any id usable as a file stem; rejects path separators and dot-files.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        anyhow::ensure!(!s.is_empty(), "session id is empty");
        anyhow::ensure!(
            !s.starts_with('.') && !s.contains(['/', '\\', '\0']),
            "invalid session id {s:?}"
        );
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub title: Option<String>,
    pub turns: Vec<ChatTurn>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            title: None,
            turns: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// The one conversation currently receiving turns. Owned by the caller (one per
/// UI client) and handed to every [`SessionStore`] operation. Start one with
/// [`SessionStore::open_context`].
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub active: Session,
}

impl SessionContext {
    pub fn new(id: SessionId) -> Self {
        Self {
            active: Session::new(id),
        }
    }
}

/// When the active session reaches disk.
///
/// `OnFinalize` keeps the history list free of the conversation being typed but
/// loses it on an abrupt exit; `EveryTurn` rewrites the file after each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    #[default]
    OnFinalize,
    EveryTurn,
}

impl PersistPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistPolicy::OnFinalize => "on_finalize",
            PersistPolicy::EveryTurn => "every_turn",
        }
    }
}

impl FromStr for PersistPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_finalize" | "finalize" => Ok(PersistPolicy::OnFinalize),
            "every_turn" | "turn" => Ok(PersistPolicy::EveryTurn),
            other => anyhow::bail!(
                "SESSION_PERSIST_POLICY must be on_finalize or every_turn, got {other:?}"
            ),
        }
    }
}

/// Current on-disk session layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub title: String,
    pub messages: Vec<ChatTurn>,
}

/// Anything a session file may contain, including the older bare turn array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StoredSession {
    Legacy(Vec<ChatTurn>),
    Record(SessionRecord),
}

impl StoredSession {
    pub fn into_parts(self) -> (Option<String>, Vec<ChatTurn>) {
        match self {
            StoredSession::Legacy(turns) => (None, turns),
            StoredSession::Record(r) => {
                let title = Some(r.title).filter(|t| !t.trim().is_empty());
                (title, r.messages)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn ids_within_one_second_are_distinct_and_ordered() {
        let issued = Mutex::new((String::new(), 0));
        let at = Local.with_ymd_and_hms(2031, 3, 4, 5, 6, 7).unwrap();
        let a = SessionId::issue(&issued, at);
        let b = SessionId::issue(&issued, at);
        let c = SessionId::issue(&issued, at);
        assert_eq!(a.as_str(), "2031-03-04_05-06-07");
        assert_eq!(b.as_str(), "2031-03-04_05-06-07-01");
        assert!(a < b && b < c);

        let later = SessionId::issue(&issued, Local.with_ymd_and_hms(2031, 3, 4, 5, 6, 8).unwrap());
        assert_eq!(later.as_str(), "2031-03-04_05-06-08");
    }

    #[test]
    fn burst_of_ids_sorts_in_creation_order() {
        let issued = Mutex::new((String::new(), 0));
        let at = Local.with_ymd_and_hms(2031, 3, 4, 5, 6, 7).unwrap();
        let ids: Vec<SessionId> = (0..12).map(|_| SessionId::issue(&issued, at)).collect();
        assert_eq!(ids[9].as_str(), "2031-03-04_05-06-07-09");
        assert_eq!(ids[10].as_str(), "2031-03-04_05-06-07-10");

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, ids);
    }

    #[test]
    fn parse_rejects_path_like_ids() {
        assert!(SessionId::parse("2024-01-02_03-04-05").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("../etc/passwd").is_err());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse(".hidden").is_err());
    }

    #[test]
    fn persist_policy_parses() {
        assert_eq!(
            "every_turn".parse::<PersistPolicy>().unwrap(),
            PersistPolicy::EveryTurn
        );
        assert_eq!(
            " On_Finalize ".parse::<PersistPolicy>().unwrap(),
            PersistPolicy::OnFinalize
        );
        assert!("sometimes".parse::<PersistPolicy>().is_err());
        assert_eq!(PersistPolicy::default(), PersistPolicy::OnFinalize);
    }

    #[test]
    fn legacy_and_record_files_yield_same_turns() {
        let messages = json!([
            {"role": "user", "content": "茅台最近走势"},
            {"role": "assistant", "content": "上涨"}
        ]);
        let legacy: StoredSession = serde_json::from_value(messages.clone()).unwrap();
        let record: StoredSession =
            serde_json::from_value(json!({"title": "茅台", "messages": messages})).unwrap();

        let (legacy_title, legacy_turns) = legacy.into_parts();
        let (title, turns) = record.into_parts();
        assert_eq!(legacy_title, None);
        assert_eq!(title.as_deref(), Some("茅台"));
        assert_eq!(legacy_turns, turns);
        assert_eq!(turns[0], ChatTurn::user("茅台最近走势"));
    }

    #[test]
    fn empty_title_reads_as_none() {
        let stored: StoredSession =
            serde_json::from_value(json!({"title": "", "messages": []})).unwrap();
        assert_eq!(stored.into_parts(), (None, Vec::new()));
    }

    #[test]
    fn turn_converts_to_chat_message() {
        let msg = ChatMessage::from(&ChatTurn::assistant("hi"));
        assert_eq!(msg, ChatMessage::assistant("hi"));
    }
}
