use crate::config::Settings;
use crate::llm::error::LlmDiagnosticsError;
use crate::llm::{ChatMessage, ChatModel, Embedder, Provider};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI-compatible chat-completions and embeddings client for the Ark endpoint.
#[derive(Debug, Clone)]
pub struct ArkClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl ArkClient {
    fn build(settings: &Settings, model: String) -> anyhow::Result<Self> {
        let api_key = settings.require_ark_api_key()?.to_string();
        let base_url = settings
            .ark_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout_secs = std::env::var("ARK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
            temperature: None,
        })
    }

    /// Conversation model (`ARK_MODEL_ID`).
    pub fn chat_from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let model = settings.require_ark_model_id()?.to_string();
        Self::build(settings, model)
    }

    /// Cheaper title model (`ARK_TITLE_MODEL_ID`). `None` when either the key or the
    /// model id is missing, which switches titling to the heuristic.
    pub fn title_from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        let (Some(_), Some(model)) = (&settings.ark_api_key, &settings.ark_title_model_id) else {
            return Ok(None);
        };
        Ok(Some(Self::build(settings, model.clone())?.with_temperature(0.3)))
    }

    pub fn embeddings_from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let model = settings.require_ark_embedding_model_id()?.to_string();
        Self::build(settings, model)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        Ok(headers)
    }

    fn request<'a>(&'a self, messages: &'a [ChatMessage], stream: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages,
            stream,
            temperature: self.temperature,
        }
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        stage: &'static str,
        body: &T,
    ) -> anyhow::Result<reqwest::Response> {
        let res = self
            .http
            .post(self.url(path))
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Ark {stage} request failed"))?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(LlmDiagnosticsError::http(Provider::Ark, stage, status, text).into());
        }
        Ok(res)
    }
}

#[async_trait::async_trait]
impl ChatModel for ArkClient {
    fn provider(&self) -> Provider {
        Provider::Ark
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let res = self
            .post("chat/completions", "chat_completions", &self.request(messages, false))
            .await?;
        let text = res
            .text()
            .await
            .context("failed to read Ark response body")?;
        let parsed = serde_json::from_str::<CompletionResponse>(&text).map_err(|err| {
            LlmDiagnosticsError::malformed(
                Provider::Ark,
                "chat_completions",
                format!("undecodable response: {err}"),
                Some(text.clone()),
            )
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                LlmDiagnosticsError::malformed(
                    Provider::Ark,
                    "chat_completions",
                    "response has no message content",
                    Some(text),
                )
                .into()
            })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> anyhow::Result<String> {
        let mut res = self
            .post("chat/completions", "chat_stream", &self.request(messages, true))
            .await?;

        let mut lines = SseLineBuffer::default();
        let mut full = String::new();
        let mut receiver_gone = false;

        'read: while let Some(bytes) = res.chunk().await.context("Ark stream interrupted")? {
            for event in lines.push(&bytes) {
                let data = match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(data) => data,
                };
                let chunk = serde_json::from_str::<StreamChunk>(&data).map_err(|err| {
                    LlmDiagnosticsError::malformed(
                        Provider::Ark,
                        "chat_stream",
                        format!("undecodable stream chunk: {err}"),
                        Some(data.clone()),
                    )
                })?;
                let Some(delta) = chunk.delta_text() else {
                    continue;
                };
                full.push_str(&delta);
                if !receiver_gone && tx.send(delta).await.is_err() {
                    tracing::debug!("stream receiver dropped; collecting remaining output");
                    receiver_gone = true;
                }
            }
        }

        Ok(full)
    }
}

#[async_trait::async_trait]
impl Embedder for ArkClient {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let res = self.post("embeddings", "embeddings", &req).await?;
        let parsed = res
            .json::<EmbeddingResponse>()
            .await
            .context("failed to decode Ark embeddings response")?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        anyhow::ensure!(
            data.len() == texts.len(),
            "embeddings count mismatch: sent {}, got {}",
            texts.len(),
            data.len()
        );
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a server-sent-event byte stream into `data:` payloads. Bytes are held
/// until a full line arrives so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == DONE_SENTINEL {
                out.push(SseEvent::Done);
            } else if !data.is_empty() {
                out.push(SseEvent::Data(data.to_string()));
            }
        }
        out
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

impl StreamChunk {
    fn delta_text(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_buffer_joins_split_lines() {
        let mut buf = SseLineBuffer::default();
        let first = buf.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());

        let second = buf.push(b"lo\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(
            second,
            vec![
                SseEvent::Data("{\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}".to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn sse_buffer_keeps_multibyte_chars_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"茅台\"}}]}\r\n".as_bytes();
        // Split inside the first CJK character.
        let split = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut buf = SseLineBuffer::default();
        assert!(buf.push(&line[..split]).is_empty());
        let events = buf.push(&line[split..]);

        let SseEvent::Data(data) = &events[0] else {
            panic!("expected data event");
        };
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.delta_text().as_deref(), Some("茅台"));
    }

    #[test]
    fn sse_buffer_ignores_comments_and_other_fields() {
        let mut buf = SseLineBuffer::default();
        let events = buf.push(b": keep-alive\nevent: message\nid: 7\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn stream_chunk_without_content_yields_nothing() {
        let v = json!({"choices": [{"delta": {"role": "assistant"}, "index": 0}]});
        let chunk: StreamChunk = serde_json::from_value(v).unwrap();
        assert_eq!(chunk.delta_text(), None);

        let v = json!({"choices": [], "usage": {"total_tokens": 10}});
        let chunk: StreamChunk = serde_json::from_value(v).unwrap();
        assert_eq!(chunk.delta_text(), None);
    }

    #[test]
    fn completion_request_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let req = CompletionRequest {
            model: "ep-123",
            messages: &messages,
            stream: true,
            temperature: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({
                "model": "ep-123",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn parses_completion_response() {
        let v = json!({
            "id": "x",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "贵州茅台"}, "finish_reason": "stop"}]
        });
        let parsed: CompletionResponse = serde_json::from_value(v).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("贵州茅台")
        );
    }

    #[test]
    fn title_client_requires_key_and_model() {
        let settings = Settings {
            ark_api_key: Some("k".to_string()),
            ..Settings::default()
        };
        assert!(ArkClient::title_from_settings(&settings).unwrap().is_none());

        let settings = Settings {
            ark_api_key: Some("k".to_string()),
            ark_title_model_id: Some("ep-title".to_string()),
            ..Settings::default()
        };
        let client = ArkClient::title_from_settings(&settings).unwrap().unwrap();
        assert_eq!(client.model_id(), "ep-title");
    }

    #[tokio::test]
    #[ignore = "requires ARK_API_KEY and ARK_MODEL_ID"]
    async fn streams_a_short_answer() {
        let settings = Settings::from_env().unwrap();
        let client = ArkClient::chat_from_settings(&settings).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let full = client
            .stream(&[ChatMessage::user("Say 'hello' and nothing else.")], tx)
            .await
            .unwrap();
        let mut streamed = String::new();
        while let Some(delta) = rx.recv().await {
            streamed.push_str(&delta);
        }
        assert_eq!(full, streamed);
        assert!(full.to_lowercase().contains("hello"));
    }
}
