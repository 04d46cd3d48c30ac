use crate::knowledge::KnowledgeBase;
use crate::llm::ChatModel;
use crate::tools::{Tool, ToolRequest, ToolResponse, KNOWLEDGE_BASE_TOOL};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct KnowledgeBaseTool {
    kb: Arc<KnowledgeBase>,
    model: Arc<dyn ChatModel>,
}

impl KnowledgeBaseTool {
    pub fn new(kb: Arc<KnowledgeBase>, model: Arc<dyn ChatModel>) -> Self {
        Self { kb, model }
    }
}

#[async_trait::async_trait]
impl Tool for KnowledgeBaseTool {
    fn name(&self) -> &'static str {
        KNOWLEDGE_BASE_TOOL
    }

    fn description(&self) -> &'static str {
        "Answers questions about financial knowledge and terminology. The knowledge base \
         contains definitions and explanations of various financial concepts."
    }

    fn input_schema(&self) -> Value {
        json!({
            "query": {"type": "string", "description": "The question to look up"}
        })
    }

    async fn run(&self, request: &ToolRequest) -> anyhow::Result<ToolResponse> {
        let ToolRequest::KnowledgeBase(q) = request else {
            anyhow::bail!("{} cannot serve {} requests", self.name(), request.tool_name());
        };

        let output = match self.kb.answer(&q.query, self.model.as_ref()).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(query = %q.query, error = %err, "knowledge base lookup failed");
                format!("Knowledge base lookup failed: {err:#}")
            }
        };
        Ok(ToolResponse::new(self.name(), output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{KeywordEmbedder, ScriptedModel};
    use crate::tools::KnowledgeQuery;

    async fn kb() -> Arc<KnowledgeBase> {
        let docs = vec![
            "term: Beta\ndefinition: Volatility relative to the market".to_string(),
            "term: Yield\ndefinition: Income as a share of price".to_string(),
        ];
        let embedder = Arc::new(KeywordEmbedder::new(&["beta", "yield", "volatility"]));
        Arc::new(KnowledgeBase::from_documents(docs, embedder).await.unwrap())
    }

    fn request(query: &str) -> ToolRequest {
        ToolRequest::KnowledgeBase(KnowledgeQuery {
            query: query.to_string(),
        })
    }

    #[tokio::test]
    async fn answers_from_the_model() {
        let model = Arc::new(ScriptedModel::new(["Beta measures volatility."]));
        let tool = KnowledgeBaseTool::new(kb().await, model);

        let res = tool.run(&request("what is beta")).await.unwrap();
        assert_eq!(res.tool, KNOWLEDGE_BASE_TOOL);
        assert_eq!(res.output, "Beta measures volatility.");
    }

    #[tokio::test]
    async fn model_failure_becomes_text() {
        let tool = KnowledgeBaseTool::new(kb().await, Arc::new(ScriptedModel::failing()));
        let res = tool.run(&request("what is beta")).await.unwrap();
        assert!(res.output.starts_with("Knowledge base lookup failed:"));
    }
}
