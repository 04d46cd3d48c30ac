//! Structured-chat agent: the model answers with one JSON action per step, either a
//! tool call or `"Final Answer"`.

use crate::llm::json::parse_json;
use crate::llm::{ChatMessage, ChatModel};
use crate::session::ChatTurn;
use crate::tools::ToolRegistry;
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_MAX_ITERATIONS: usize = 3;
pub const FINAL_ANSWER: &str = "Final Answer";

/// Progress notifications for the UI while a turn is being answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Thinking,
    ToolCall { tool: String },
    Analyzing,
    Delta(String),
}

impl AgentEvent {
    /// Status line for the non-text events.
    pub fn status(&self) -> Option<String> {
        match self {
            AgentEvent::Thinking => Some("Thinking...".to_string()),
            AgentEvent::ToolCall { tool } => Some(format!("Querying tool: {tool}...")),
            AgentEvent::Analyzing => Some("Analyzing...".to_string()),
            AgentEvent::Delta(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActionBlob {
    action: String,
    #[serde(default)]
    action_input: Value,
}

enum Step {
    Final(String),
    Tool { name: String, input: Value },
}

fn parse_step(reply: &str) -> anyhow::Result<Step> {
    let blob: ActionBlob = parse_json(reply)?;
    if blob.action.trim() == FINAL_ANSWER {
        let answer = match blob.action_input {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        return Ok(Step::Final(answer));
    }
    Ok(Step::Tool {
        name: blob.action,
        input: blob.action_input,
    })
}

pub struct FinancialAgent {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    max_iterations: usize,
}

impl FinancialAgent {
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolRegistry) -> Self {
        Self {
            model,
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Answers `input` given the earlier turns of the conversation. Progress and the
    /// answer text go to `events`; the full answer is also returned.
    pub async fn respond(
        &self,
        history: &[ChatTurn],
        input: &str,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<String> {
        let today = crate::time::today_cst(chrono::Utc::now())?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt()));
        messages.extend(history.iter().map(ChatMessage::from));
        messages.push(ChatMessage::user(format!(
            "Today's date is {today}. The user's request is: {input}"
        )));

        emit(&events, AgentEvent::Thinking).await;
        let mut format_retry_used = false;

        for iteration in 0..self.max_iterations {
            let reply = self
                .model
                .complete(&messages)
                .await
                .context("agent model call failed")?;

            let step = match parse_step(&reply) {
                Ok(step) => step,
                Err(err) if !format_retry_used => {
                    tracing::debug!(iteration, error = %err, "unparseable agent step; asking again");
                    format_retry_used = true;
                    messages.push(ChatMessage::assistant(reply));
                    messages.push(ChatMessage::user(format!(
                        "Observation: Invalid format: {err}. Respond with exactly one JSON blob \
                         containing \"action\" and \"action_input\"."
                    )));
                    continue;
                }
                // Second miss: the model is answering in prose; take it as the answer.
                Err(_) => Step::Final(reply.trim().to_string()),
            };

            match step {
                Step::Final(answer) => {
                    tracing::info!(iteration, chars = answer.chars().count(), "agent answered");
                    emit(&events, AgentEvent::Delta(answer.clone())).await;
                    return Ok(answer);
                }
                Step::Tool { name, input } => {
                    emit(&events, AgentEvent::ToolCall { tool: name.clone() }).await;
                    let observation = match self.tools.dispatch(&name, &input).await {
                        Ok(res) => res.output,
                        Err(err) => {
                            tracing::warn!(tool = %name, error = %err, "tool call rejected");
                            format!("Tool error: {err:#}")
                        }
                    };
                    emit(&events, AgentEvent::Analyzing).await;
                    messages.push(ChatMessage::assistant(reply));
                    messages.push(ChatMessage::user(format!("Observation: {observation}")));
                }
            }
        }

        tracing::info!(
            max_iterations = self.max_iterations,
            "agent step budget exhausted; streaming a summary answer"
        );
        messages.push(ChatMessage::user(
            "Stop calling tools. Using the observations above, write the final answer to the \
             user's request in plain prose, without JSON.",
        ));
        self.stream_answer(&messages, &events).await
    }

    async fn stream_answer(
        &self,
        messages: &[ChatMessage],
        events: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<String> {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        let forward = async {
            while let Some(delta) = rx.recv().await {
                emit(events, AgentEvent::Delta(delta)).await;
            }
        };
        let (answer, ()) = tokio::join!(self.model.stream(messages, tx), forward);
        answer.context("agent answer stream failed")
    }

    fn system_prompt(&self) -> String {
        let tools = self
            .tools
            .iter()
            .map(|t| format!("{}: {}, args: {}", t.name(), t.description(), t.input_schema()))
            .collect::<Vec<_>>()
            .join("\n");
        let names = self
            .tools
            .names()
            .iter()
            .map(|n| format!("{n:?}"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"You are a financial assistant. Respond to the user as helpfully and accurately as possible. You have access to the following tools:

{tools}

Use a JSON blob to pick a tool: an "action" key (tool name) and an "action_input" key (tool input).
Valid "action" values: "{FINAL_ANSWER}" or {names}

Provide only ONE action per JSON blob, as shown:

```
{{"action": $TOOL_NAME, "action_input": $INPUT}}
```

After each tool call you will receive an Observation. When you can answer, respond with:

```
{{"action": "{FINAL_ANSWER}", "action_input": "Final response to the user"}}
```

Always respond with a single valid JSON blob. Use tools if necessary; respond directly if appropriate. Answer in the user's language."#
        )
    }
}

async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("agent event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;
    use crate::llm::Role;
    use crate::tools::{Tool, ToolRequest, ToolResponse, FINANCIAL_DATA_TOOL};
    use serde_json::json;

    struct CannedMarket;

    #[async_trait::async_trait]
    impl Tool for CannedMarket {
        fn name(&self) -> &'static str {
            FINANCIAL_DATA_TOOL
        }

        fn description(&self) -> &'static str {
            "Fetches daily bars."
        }

        fn input_schema(&self) -> Value {
            json!({"symbol": {"type": "string"}})
        }

        async fn run(&self, request: &ToolRequest) -> anyhow::Result<ToolResponse> {
            let ToolRequest::FinancialData(q) = request else {
                anyhow::bail!("wrong request");
            };
            Ok(ToolResponse::new(
                FINANCIAL_DATA_TOOL,
                format!("bars for {}", q.symbol),
            ))
        }
    }

    fn agent(model: Arc<ScriptedModel>) -> FinancialAgent {
        let mut tools = ToolRegistry::default();
        tools.register(Arc::new(CannedMarket));
        FinancialAgent::new(model, tools)
    }

    fn tool_call(symbol: &str) -> String {
        json!({
            "action": FINANCIAL_DATA_TOOL,
            "action_input": {"symbol": symbol, "start_date": "2024-01-02", "end_date": "2024-01-05"}
        })
        .to_string()
    }

    fn final_answer(text: &str) -> String {
        format!("```json\n{}\n```", json!({"action": FINAL_ANSWER, "action_input": text}))
    }

    async fn run(
        agent: &FinancialAgent,
        history: &[ChatTurn],
        input: &str,
    ) -> (anyhow::Result<String>, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let answer = agent.respond(history, input, tx).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (answer, events)
    }

    #[tokio::test]
    async fn direct_answer() {
        let model = Arc::new(ScriptedModel::new([final_answer("Hello!")]));
        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hey")];
        let (answer, events) = run(&agent(model.clone()), &history, "who are you").await;

        assert_eq!(answer.unwrap(), "Hello!");
        assert_eq!(
            events,
            vec![AgentEvent::Thinking, AgentEvent::Delta("Hello!".to_string())]
        );

        let sent = &model.calls()[0];
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.contains(FINANCIAL_DATA_TOOL));
        assert_eq!(sent[1], ChatMessage::user("hi"));
        assert!(sent[3].content.starts_with("Today's date is "));
        assert!(sent[3].content.ends_with("The user's request is: who are you"));
    }

    #[tokio::test]
    async fn tool_observation_feeds_next_step() {
        let model = Arc::new(ScriptedModel::new([
            tool_call("AAPL"),
            final_answer("AAPL rose."),
        ]));
        let (answer, events) = run(&agent(model.clone()), &[], "How did AAPL do?").await;

        assert_eq!(answer.unwrap(), "AAPL rose.");
        assert_eq!(
            events,
            vec![
                AgentEvent::Thinking,
                AgentEvent::ToolCall {
                    tool: FINANCIAL_DATA_TOOL.to_string()
                },
                AgentEvent::Analyzing,
                AgentEvent::Delta("AAPL rose.".to_string()),
            ]
        );
        let second = &model.calls()[1];
        assert_eq!(
            second.last().unwrap().content,
            "Observation: bars for AAPL"
        );
    }

    #[tokio::test]
    async fn bad_tool_input_becomes_observation() {
        let model = Arc::new(ScriptedModel::new([
            json!({"action": "Stock Screener", "action_input": {}}).to_string(),
            final_answer("Sorry."),
        ]));
        let (answer, _) = run(&agent(model.clone()), &[], "screen stocks").await;
        assert_eq!(answer.unwrap(), "Sorry.");
        assert!(model.calls()[1]
            .last()
            .unwrap()
            .content
            .starts_with("Observation: Tool error: unknown tool"));
    }

    #[tokio::test]
    async fn malformed_output_is_retried_once() {
        let model = Arc::new(ScriptedModel::new([
            "I think...".to_string(),
            final_answer("Fine."),
        ]));
        let (answer, _) = run(&agent(model.clone()), &[], "q").await;
        assert_eq!(answer.unwrap(), "Fine.");
        assert!(model.calls()[1]
            .last()
            .unwrap()
            .content
            .starts_with("Observation: Invalid format"));
    }

    #[tokio::test]
    async fn repeated_prose_is_taken_as_answer() {
        let model = Arc::new(ScriptedModel::new(["not json", " Plain answer. "]));
        let (answer, events) = run(&agent(model), &[], "q").await;
        assert_eq!(answer.unwrap(), "Plain answer.");
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Delta("Plain answer.".to_string()))
        );
    }

    #[tokio::test]
    async fn exhausted_budget_streams_summary() {
        let model = Arc::new(ScriptedModel::new([
            tool_call("MSFT"),
            "MSFT closed higher over the week.".to_string(),
        ]));
        let agent = agent(model.clone()).with_max_iterations(1);
        let (answer, events) = run(&agent, &[], "MSFT this week?").await;

        let answer = answer.unwrap();
        assert_eq!(answer, "MSFT closed higher over the week.");
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, answer);
        assert!(model.calls()[1]
            .last()
            .unwrap()
            .content
            .starts_with("Stop calling tools."));
    }

    #[tokio::test]
    async fn model_failure_is_an_error() {
        let (answer, events) = run(&agent(Arc::new(ScriptedModel::failing())), &[], "q").await;
        assert!(answer.is_err());
        assert_eq!(events, vec![AgentEvent::Thinking]);
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            AgentEvent::ToolCall {
                tool: "X".to_string()
            }
            .status()
            .as_deref(),
            Some("Querying tool: X...")
        );
        assert_eq!(AgentEvent::Delta("a".to_string()).status(), None);
    }
}
