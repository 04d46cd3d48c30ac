//! Typed tool boundary between the agent and the services it can call.
//!
//! The model names a tool and supplies loosely shaped JSON; [`ToolRequest::from_action`]
//! turns that into a typed request before anything runs.

pub mod knowledge;
pub mod market;

pub use knowledge::KnowledgeBaseTool;
pub use market::FinancialDataTool;

use crate::config::Settings;
use crate::knowledge::KnowledgeBase;
use crate::llm::ark::ArkClient;
use crate::llm::ChatModel;
use crate::market::{MarketDataResolver, MarketQuery};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const FINANCIAL_DATA_TOOL: &str = "Financial Data Retrieval";
pub const KNOWLEDGE_BASE_TOOL: &str = "Financial Knowledge Base";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum ToolRequest {
    FinancialData(MarketQuery),
    KnowledgeBase(KnowledgeQuery),
}

impl ToolRequest {
    /// Display name of the tool that serves this request.
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolRequest::FinancialData(_) => FINANCIAL_DATA_TOOL,
            ToolRequest::KnowledgeBase(_) => KNOWLEDGE_BASE_TOOL,
        }
    }

    /// Decodes a model-issued action. Models sometimes send the input object as a
    /// JSON string, or a bare string for the knowledge query; both are accepted.
    pub fn from_action(name: &str, input: &Value) -> Result<Self> {
        match name.trim() {
            FINANCIAL_DATA_TOOL => {
                let input = match input {
                    Value::String(s) => serde_json::from_str::<Value>(s)
                        .with_context(|| format!("{FINANCIAL_DATA_TOOL} input is not an object: {s}"))?,
                    other => other.clone(),
                };
                let query = serde_json::from_value::<MarketQuery>(input).with_context(|| {
                    format!("{FINANCIAL_DATA_TOOL} expects symbol, start_date and end_date")
                })?;
                Ok(ToolRequest::FinancialData(query))
            }
            KNOWLEDGE_BASE_TOOL => {
                let query = match input {
                    Value::String(s) => s.clone(),
                    Value::Object(map) => map
                        .get("query")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .with_context(|| format!("{KNOWLEDGE_BASE_TOOL} expects a query string"))?,
                    other => anyhow::bail!("{KNOWLEDGE_BASE_TOOL} expects a query string, got {other}"),
                };
                anyhow::ensure!(!query.trim().is_empty(), "{KNOWLEDGE_BASE_TOOL} query is empty");
                Ok(ToolRequest::KnowledgeBase(KnowledgeQuery { query }))
            }
            other => anyhow::bail!("unknown tool {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub tool: String,
    pub output: String,
}

impl ToolResponse {
    pub fn new(tool: &str, output: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            output: output.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the `action_input` the model must send.
    fn input_schema(&self) -> Value;

    async fn run(&self, request: &ToolRequest) -> Result<ToolResponse>;
}

/// Ordered set of tools offered to the agent, looked up by display name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Market data is always available; the knowledge base joins only when
    /// `KNOWLEDGE_BASE_CSV` is configured.
    pub async fn from_settings(settings: &Settings, model: Arc<dyn ChatModel>) -> Result<Self> {
        let mut registry = Self::default();
        let resolver = MarketDataResolver::from_settings(settings)?;
        tracing::info!(sources = ?resolver.source_names(), "market data sources");
        registry.register(Arc::new(FinancialDataTool::new(resolver)));

        match &settings.knowledge_base_csv {
            Some(path) => {
                let embedder = Arc::new(ArkClient::embeddings_from_settings(settings)?);
                let kb = KnowledgeBase::from_csv(path, embedder).await?;
                registry.register(Arc::new(KnowledgeBaseTool::new(Arc::new(kb), model)));
            }
            None => tracing::info!("KNOWLEDGE_BASE_CSV not set; knowledge base tool disabled"),
        }
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name.trim())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn dispatch(&self, name: &str, input: &Value) -> Result<ToolResponse> {
        let tool = self
            .get(name)
            .with_context(|| format!("unknown tool {name:?}; available: {:?}", self.names()))?;
        let request = ToolRequest::from_action(name, input)?;
        tool.run(&request).await
    }
}
