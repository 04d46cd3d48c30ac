use crate::llm::Provider;
use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;

/// Model-call failure with enough context to log or show in the transcript.
/// Recover it from an `anyhow::Error` with `downcast_ref`.
#[derive(Debug, Clone)]
pub struct LlmDiagnosticsError {
    pub provider: Provider,
    pub stage: &'static str,
    pub detail: String,
    pub raw_output: Option<String>,
    pub raw_response_json: Option<Value>,
}

impl LlmDiagnosticsError {
    pub(crate) fn http(
        provider: Provider,
        stage: &'static str,
        status: StatusCode,
        body: String,
    ) -> Self {
        let raw_response_json = serde_json::from_str::<Value>(&body).ok();
        let detail = raw_response_json
            .as_ref()
            .and_then(|v| v.pointer("/error/message"))
            .and_then(Value::as_str)
            .map(|m| format!("status={status} message={m}"))
            .unwrap_or_else(|| format!("status={status}"));
        Self {
            provider,
            stage,
            detail,
            raw_output: Some(body),
            raw_response_json,
        }
    }

    pub(crate) fn malformed(
        provider: Provider,
        stage: &'static str,
        detail: impl Into<String>,
        raw: Option<String>,
    ) -> Self {
        Self {
            provider,
            stage,
            detail: detail.into(),
            raw_output: raw,
            raw_response_json: None,
        }
    }
}

impl fmt::Display for LlmDiagnosticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LLM error (provider={:?}, stage={}): {}",
            self.provider, self.stage, self.detail
        )
    }
}

impl std::error::Error for LlmDiagnosticsError {}
