use crate::config::Settings;
use crate::llm::ark::ArkClient;
use crate::llm::{ChatMessage, ChatModel};
use crate::session::{ChatTurn, TurnRole};
use std::sync::Arc;

pub const MAX_TITLE_CHARS: usize = 12;
pub const PLACEHOLDER_TITLE: &str = "New chat";
const CONTEXT_TURNS: usize = 6;

/// Short history-list titles. Uses a cheap model when one is configured and falls
/// back to the latest user message otherwise.
#[derive(Clone, Default)]
pub struct TitleGenerator {
    model: Option<Arc<dyn ChatModel>>,
}

impl TitleGenerator {
    pub fn new(model: Option<Arc<dyn ChatModel>>) -> Self {
        Self { model }
    }

    pub fn heuristic() -> Self {
        Self { model: None }
    }

    /// Uses `ARK_TITLE_MODEL_ID` when it and `ARK_API_KEY` are set.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let model = ArkClient::title_from_settings(settings)?
            .map(|client| Arc::new(client) as Arc<dyn ChatModel>);
        if model.is_none() {
            tracing::info!("ARK_TITLE_MODEL_ID not set; using heuristic session titles");
        }
        Ok(Self { model })
    }

    /// At most [`MAX_TITLE_CHARS`] chars, no newlines. Never fails.
    pub async fn generate(&self, turns: &[ChatTurn]) -> String {
        if let Some(model) = &self.model {
            match model.complete(&[ChatMessage::user(title_prompt(turns))]).await {
                Ok(raw) => {
                    let title = clean_title(&raw);
                    if !title.is_empty() {
                        return title;
                    }
                    tracing::debug!("title model returned nothing usable");
                }
                Err(err) => {
                    tracing::warn!(model = model.model_id(), error = %err, "title generation failed");
                }
            }
        }
        fallback_title(turns)
    }
}

fn title_prompt(turns: &[ChatTurn]) -> String {
    let recent = &turns[turns.len().saturating_sub(CONTEXT_TURNS)..];
    let transcript = recent
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Write a title for the conversation below in at most {MAX_TITLE_CHARS} characters, \
         with no punctuation. Reply with the title only.\n\n{transcript}"
    )
}

fn clean_title(raw: &str) -> String {
    let flat: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    let trimmed = flat.trim().trim_matches(['"', '\'', '“', '”', '《', '》']);
    trimmed
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

fn fallback_title(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::User)
        .map(|t| clean_title(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string())
}
