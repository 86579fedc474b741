//! Tool-calling question answering over the knowledge graph.
//!
//! The loop lets the model call `hybrid_graph_rag` a bounded number of
//! times, then asks for a schema-constrained final answer with tools
//! disabled. The answer is cleaned up and its citations resolved against
//! the last retrieval before it is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parlgraph_provider::{ContentBlock, LlmMessage, LlmProvider, LlmRequest, LlmResponse, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::answer::postprocess_answer;
use crate::citations::{desired_sources, resolve_citation_ids, resolve_sources};
use crate::draft::extract_json_object;
use crate::retriever::{Citation, HybridRetriever, RetrievalParams, RetrievalResult};
use crate::tool::{HybridGraphRagTool, ToolRegistry, HYBRID_GRAPH_RAG};

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 4;
pub const DEFAULT_AGENT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_HISTORY_LIMIT: usize = 16;
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 120;
const AGENT_TEMPERATURE: f32 = 0.2;

const NO_ANSWER: &str = "I couldn't generate an answer.";
const NO_EVIDENCE: &str = "I couldn't find enough evidence to answer that.";
const LOW_CONFIDENCE: &str =
    "I wasn't able to search the parliamentary record for that just now, so I can't give a grounded answer. Please try again or rephrase the question.";

const AGENT_SYSTEM_PROMPT: &str = "\
You are a guide to parliamentary debates. Ground every answer in evidence retrieved from the knowledge graph and the transcript utterances it cites.

Rules:
- Before answering, call the tool `hybrid_graph_rag` to retrieve a compact subgraph with citations.
- Use ONLY the tool results as your source of truth. Do not invent facts.
- When you make a claim, cite at least one supporting utterance by listing its `utterance_id` in `cite_utterance_ids`.
- Put the ids of the graph nodes the answer is about in `focus_node_ids`.
- Offer up to four short follow-up questions in `followup_questions`.
- If the evidence is insufficient, say so clearly and suggest a more precise question.
- Return JSON only, matching the response schema.";

/// Schema enforced on the final answer request.
pub fn agent_response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "answer": {"type": "string"},
            "cite_utterance_ids": {"type": "array", "items": {"type": "string"}},
            "focus_node_ids": {"type": "array", "items": {"type": "string"}},
            "followup_questions": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["answer", "cite_utterance_ids", "focus_node_ids", "followup_questions"]
    })
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_tool_iterations: usize,
    pub max_tokens: u32,
    pub history_limit: usize,
    pub timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            max_tokens: DEFAULT_AGENT_MAX_TOKENS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        }
    }
}

/// The JSON object the model returns as its final answer.
#[derive(Debug, Clone, Default, Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    cite_utterance_ids: Vec<String>,
    #[serde(default)]
    focus_node_ids: Vec<String>,
    #[serde(default)]
    followup_questions: Vec<String>,
}

impl AnswerPayload {
    /// Parses the schema object, or keeps the raw text as the answer.
    fn from_text(text: &str) -> Self {
        let parsed = extract_json_object(text)
            .ok()
            .filter(|obj| obj.contains_key("answer"))
            .and_then(|obj| serde_json::from_value::<AnswerPayload>(serde_json::Value::Object(obj)).ok());
        match parsed {
            Some(payload) => payload,
            None => {
                let raw = text.trim();
                Self {
                    answer: if raw.is_empty() { NO_ANSWER.to_string() } else { raw.to_string() },
                    ..Default::default()
                }
            }
        }
    }

    fn parses(text: &str) -> bool {
        extract_json_object(text).is_ok_and(|obj| obj.contains_key("answer"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentAnswer {
    pub answer: String,
    pub cite_utterance_ids: Vec<String>,
    pub focus_node_ids: Vec<String>,
    pub followup_questions: Vec<String>,
    pub sources: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalResult>,
    pub tool_iterations: usize,
    pub low_confidence: bool,
}

impl AgentAnswer {
    fn low_confidence() -> Self {
        Self {
            answer: LOW_CONFIDENCE.to_string(),
            cite_utterance_ids: Vec::new(),
            focus_node_ids: Vec::new(),
            followup_questions: Vec::new(),
            sources: Vec::new(),
            retrieval: None,
            tool_iterations: 0,
            low_confidence: true,
        }
    }
}

enum LoopState {
    AwaitingToolDecision,
    ToolExecuting(Vec<ContentBlock>),
    AwaitingFinalAnswer,
    Done(String),
}

/// What the loop produced before post-processing.
struct LoopOutcome {
    final_text: String,
    retrieval: Option<RetrievalResult>,
    tool_iterations: usize,
}

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    model: String,
    retry: RetryPolicy,
    retriever: Arc<HybridRetriever>,
    tools: ToolRegistry,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        retry: RetryPolicy,
        retriever: Arc<HybridRetriever>,
        retrieval_defaults: RetrievalParams,
        settings: AgentSettings,
    ) -> Self {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(HybridGraphRagTool::new(retriever.clone(), retrieval_defaults)));
        Self {
            provider,
            model: model.into(),
            retry,
            retriever,
            tools,
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Answers `question` given earlier turns. Never fails: timeouts,
    /// cancellation and provider errors yield a low-confidence answer.
    pub async fn run(&self, question: &str, history: &[LlmMessage], cancel: &CancellationToken) -> AgentAnswer {
        let question = question.trim();
        if question.is_empty() {
            tracing::warn!("agent asked an empty question");
            return AgentAnswer::low_confidence();
        }

        let outcome = match tokio::time::timeout(self.settings.timeout, self.run_loop(question, history, cancel)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!("agent loop failed, answering with low confidence: {e:#}");
                return AgentAnswer::low_confidence();
            }
            Err(_) => {
                tracing::warn!(
                    "agent loop timed out after {}s, answering with low confidence",
                    self.settings.timeout.as_secs()
                );
                return AgentAnswer::low_confidence();
            }
        };

        self.finish(outcome).await
    }

    fn initial_messages(&self, question: &str, history: &[LlmMessage]) -> Vec<LlmMessage> {
        let kept: Vec<&LlmMessage> = history
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .filter(|m| !m.text().trim().is_empty())
            .collect();
        let skip = kept.len().saturating_sub(self.settings.history_limit);
        let mut messages: Vec<LlmMessage> = kept
            .into_iter()
            .skip(skip)
            .map(|m| LlmMessage {
                role: m.role.clone(),
                content: vec![ContentBlock::Text { text: m.text() }],
            })
            .collect();
        messages.push(LlmMessage::user(question));
        messages
    }

    fn request(&self, messages: &[LlmMessage], with_tools: bool) -> LlmRequest {
        LlmRequest {
            model: self.model.clone(),
            system: Some(AGENT_SYSTEM_PROMPT.to_string()),
            messages: messages.to_vec(),
            max_tokens: self.settings.max_tokens,
            tools: if with_tools { self.tools.tool_defs() } else { vec![] },
            temperature: Some(AGENT_TEMPERATURE),
            response_schema: if with_tools { None } else { Some(agent_response_schema()) },
        }
    }

    async fn cancellable<T>(&self, cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow!("agent loop cancelled")),
            result = fut => result,
        }
    }

    async fn chat(&self, cancel: &CancellationToken, request: LlmRequest) -> Result<LlmResponse> {
        self.cancellable(cancel, self.retry.chat(self.provider.as_ref(), request))
            .await
    }

    async fn run_loop(&self, question: &str, history: &[LlmMessage], cancel: &CancellationToken) -> Result<LoopOutcome> {
        let mut messages = self.initial_messages(question, history);
        let mut retrieval: Option<RetrievalResult> = None;
        let mut iterations = 0;
        let mut state = LoopState::AwaitingToolDecision;

        loop {
            state = match state {
                LoopState::AwaitingToolDecision => {
                    let resp = self.chat(cancel, self.request(&messages, true)).await?;
                    if resp.has_tool_calls() {
                        LoopState::ToolExecuting(resp.content)
                    } else if AnswerPayload::parses(&resp.text) {
                        LoopState::Done(resp.text)
                    } else {
                        LoopState::AwaitingFinalAnswer
                    }
                }
                LoopState::ToolExecuting(content) => {
                    iterations += 1;
                    let mut results = Vec::new();
                    for block in &content {
                        let ContentBlock::ToolUse { id, name, input } = block else {
                            continue;
                        };
                        let (output, is_error) = self.execute_tool(cancel, name, input.clone()).await?;
                        if name == HYBRID_GRAPH_RAG && !is_error {
                            match serde_json::from_str::<RetrievalResult>(&output) {
                                Ok(result) => retrieval = Some(result),
                                Err(e) => tracing::warn!("unreadable {HYBRID_GRAPH_RAG} output: {e}"),
                            }
                        }
                        results.push(ContentBlock::ToolResult {
                            tool_use_id: id.clone(),
                            content: output,
                            is_error,
                        });
                    }
                    messages.push(LlmMessage {
                        role: "assistant".into(),
                        content,
                    });
                    messages.push(LlmMessage {
                        role: "user".into(),
                        content: results,
                    });

                    if iterations >= self.settings.max_tool_iterations {
                        tracing::warn!("agent used {iterations} tool rounds, requesting final answer");
                        LoopState::AwaitingFinalAnswer
                    } else {
                        LoopState::AwaitingToolDecision
                    }
                }
                LoopState::AwaitingFinalAnswer => {
                    let resp = self.chat(cancel, self.request(&messages, false)).await?;
                    LoopState::Done(resp.text)
                }
                LoopState::Done(final_text) => {
                    return Ok(LoopOutcome {
                        final_text,
                        retrieval,
                        tool_iterations: iterations,
                    });
                }
            };
        }
    }

    /// Runs one tool call. Unknown tools and tool failures become error
    /// payloads for the model; only cancellation aborts the loop.
    async fn execute_tool(&self, cancel: &CancellationToken, name: &str, input: serde_json::Value) -> Result<(String, bool)> {
        if !self.tools.contains(name) {
            tracing::warn!("model called unknown tool {name}");
            return Ok((serde_json::json!({ "error": format!("unknown tool: {name}") }).to_string(), true));
        }
        tracing::debug!("executing tool {name} with {input}");
        match self.cancellable(cancel, self.tools.execute(name, input)).await {
            Ok(output) => Ok((output.content, output.is_error)),
            Err(e) if cancel.is_cancelled() => Err(e),
            Err(e) => Ok((serde_json::json!({ "error": format!("{e:#}") }).to_string(), true)),
        }
    }

    async fn finish(&self, outcome: LoopOutcome) -> AgentAnswer {
        let payload = AnswerPayload::from_text(&outcome.final_text);
        let processed = postprocess_answer(&payload.answer, &payload.followup_questions);
        let answer = if processed.answer.is_empty() {
            NO_EVIDENCE.to_string()
        } else {
            processed.answer
        };

        let retrieval = outcome.retrieval;
        let cite_utterance_ids = resolve_citation_ids(&answer, &payload.cite_utterance_ids, retrieval.as_ref());
        let sources = resolve_sources(
            &self.retriever,
            retrieval.as_ref(),
            &cite_utterance_ids,
            desired_sources(cite_utterance_ids.len()),
        )
        .await;
        let focus_node_ids: Vec<String> = payload
            .focus_node_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        tracing::info!(
            "agent answered with {} citations, {} sources after {} tool rounds",
            cite_utterance_ids.len(),
            sources.len(),
            outcome.tool_iterations
        );

        AgentAnswer {
            answer,
            cite_utterance_ids,
            focus_node_ids,
            followup_questions: processed.followup_questions,
            sources,
            retrieval,
            tool_iterations: outcome.tool_iterations,
            low_confidence: false,
        }
    }
}
