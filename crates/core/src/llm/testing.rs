use crate::llm::{ChatMessage, ChatModel, Embedder, Provider};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Replays canned replies in order and records every prompt it was sent. Once the
/// script runs out, calls fail.
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub(crate) fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self::new(Vec::<String>::new())
    }

    pub(crate) fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted model has no reply left"))
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    fn provider(&self) -> Provider {
        Provider::Ark
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        self.next_reply(messages)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> anyhow::Result<String> {
        let reply = self.next_reply(messages)?;
        for piece in reply.split_inclusive(' ') {
            let _ = tx.send(piece.to_string()).await;
        }
        Ok(reply)
    }
}

/// Embeds text as keyword counts over a fixed vocabulary.
pub(crate) struct KeywordEmbedder {
    vocabulary: Vec<&'static str>,
}

impl KeywordEmbedder {
    pub(crate) fn new(vocabulary: &[&'static str]) -> Self {
        Self {
            vocabulary: vocabulary.to_vec(),
        }
    }
}

#[async_trait::async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                self.vocabulary
                    .iter()
                    .map(|w| lower.matches(w).count() as f32)
                    .collect()
            })
            .collect())
    }
}
