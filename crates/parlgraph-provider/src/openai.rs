use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{ContentBlock, LlmMessage, LlmProvider, LlmRequest, LlmResponse};

/// OpenAI chat-completions provider. Also serves OpenAI-compatible hosts
/// such as Cerebras and Ollama through a different `api_base`.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn to_api_request(request: LlmRequest) -> ApiRequest {
        let tools = request
            .tools
            .into_iter()
            .map(|tool| ApiTool {
                tool_type: "function",
                function: ApiFunctionDef {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                },
            })
            .collect();

        let response_format = request.response_schema.map(|schema| ApiResponseFormat {
            format_type: "json_schema",
            json_schema: ApiJsonSchema {
                name: "response",
                strict: true,
                schema,
            },
        });

        ApiRequest {
            model: request.model,
            messages: to_api_messages(request.system, request.messages),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            response_format,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = Self::to_api_request(request);

        let mut builder = self.client.post(url);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = match builder.json(&payload).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "openai api error (timeout) [retryable]: request timed out"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("openai api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            return Err(format_api_error(status, &text));
        }

        let body: ApiResponse = resp.json().await?;
        to_llm_response(body)
    }
}

fn to_api_messages(system: Option<String>, messages: Vec<LlmMessage>) -> Vec<ApiMessage> {
    let mut result = Vec::new();

    if let Some(system_text) = system {
        result.push(ApiMessage {
            role: "system".to_string(),
            content: Some(system_text),
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
    }

    for message in messages {
        let text = message.text();
        let tool_calls: Vec<ApiToolCall> = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ApiToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ApiToolFunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                _ => None,
            })
            .collect();

        if !text.is_empty() || !tool_calls.is_empty() {
            result.push(ApiMessage {
                role: message.role,
                content: (!text.is_empty()).then_some(text),
                tool_calls,
                tool_call_id: None,
            });
        }

        for block in message.content {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } = block
            {
                result.push(ApiMessage {
                    role: "tool".to_string(),
                    content: Some(content),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(tool_use_id),
                });
            }
        }
    }

    result
}

fn to_llm_response(body: ApiResponse) -> Result<LlmResponse> {
    let usage = body.usage;
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("openai api error [retryable]: empty choices"))?;
    let text = choice.message.content.unwrap_or_default();

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text: text.clone() });
    }
    for call in choice.message.tool_calls.into_iter().flatten() {
        let input = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => Some("tool_use".to_string()),
        Some("stop") => Some("end_turn".to_string()),
        Some("length") => Some("max_tokens".to_string()),
        _ => choice.finish_reason,
    };

    Ok(LlmResponse {
        text,
        content,
        input_tokens: usage.as_ref().map(|u| u.prompt_tokens),
        output_tokens: usage.as_ref().map(|u| u.completion_tokens),
        stop_reason,
    })
}

/// Uses the `error.message` of an OpenAI error envelope when the body has
/// one, the raw body otherwise.
fn format_api_error(status: StatusCode, text: &str) -> anyhow::Error {
    let retryable = match status.as_u16() {
        408 | 429 | 500..=599 => " [retryable]",
        _ => "",
    };
    let detail = serde_json::from_str::<ApiErrorEnvelope>(text)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| text.trim().to_string());
    anyhow!("openai api error ({status}){retryable}: {detail}")
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ApiResponseFormat>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunctionDef,
}

#[derive(Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ApiResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: ApiJsonSchema,
}

#[derive(Serialize)]
struct ApiJsonSchema {
    name: &'static str,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiAssistantMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiAssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ApiToolFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct ApiToolFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;

    #[test]
    fn to_api_request_maps_tools_and_tool_results() {
        let req = LlmRequest {
            model: "gpt-oss-120b".into(),
            system: Some("Return JSON only.".into()),
            messages: vec![
                LlmMessage::user("hello"),
                LlmMessage {
                    role: "assistant".into(),
                    content: vec![ContentBlock::ToolUse {
                        id: "call_1".into(),
                        name: "hybrid_graph_rag".into(),
                        input: serde_json::json!({"query": "water"}),
                    }],
                },
                LlmMessage {
                    role: "user".into(),
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: "call_1".into(),
                        content: "{}".into(),
                        is_error: false,
                    }],
                },
            ],
            max_tokens: 100,
            tools: vec![ToolDef {
                name: "hybrid_graph_rag".into(),
                description: "Search".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            temperature: Some(0.0),
            response_schema: None,
        };

        let api = OpenAiProvider::to_api_request(req);
        assert_eq!(api.messages[0].role, "system");
        assert_eq!(api.messages[2].tool_calls[0].id, "call_1");
        assert_eq!(api.messages[3].role, "tool");
        assert_eq!(api.messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(api.tools[0].tool_type, "function");
        assert!(api.response_format.is_none());
    }

    #[test]
    fn response_schema_becomes_json_schema_format() {
        let req = LlmRequest::simple("m".into(), None, "x".into())
            .with_response_schema(serde_json::json!({"type": "object"}));
        let api = OpenAiProvider::to_api_request(req);
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["schema"]["type"], "object");
    }

    #[test]
    fn to_llm_response_parses_tool_calls() {
        let body: ApiResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "hybrid_graph_rag", "arguments": "{\"query\":\"tax\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3}
        }))
        .unwrap();

        let resp = to_llm_response(body).unwrap();
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert!(resp.has_tool_calls());
        assert_eq!(resp.input_tokens, Some(10));
    }

    #[test]
    fn api_errors_use_envelope_message_and_tag_retryable_statuses() {
        let err = format_api_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "Rate limit reached", "type": "requests"}}"#,
        );
        assert_eq!(
            err.to_string(),
            "openai api error (429 Too Many Requests) [retryable]: Rate limit reached"
        );
        let err = format_api_error(StatusCode::UNAUTHORIZED, "bad key");
        assert!(!err.to_string().contains("[retryable]"));
        assert!(err.to_string().ends_with(": bad key"));
        assert!(format_api_error(StatusCode::BAD_GATEWAY, "").to_string().contains("[retryable]"));
    }

    #[test]
    fn plain_replies_map_finish_reasons() {
        let body: ApiResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {"content": "Partial answer", "tool_calls": null},
                "finish_reason": "length"
            }]
        }))
        .unwrap();
        let resp = to_llm_response(body).unwrap();
        assert_eq!(resp.stop_reason.as_deref(), Some("max_tokens"));
        assert_eq!(resp.text, "Partial answer");
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.input_tokens, None);

        let empty: ApiResponse = serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(to_llm_response(empty).unwrap_err().to_string().contains("[retryable]"));
    }

    #[test]
    fn tool_free_requests_omit_tools_and_null_fields() {
        let api = OpenAiProvider::to_api_request(LlmRequest::simple("m".into(), None, "x".into()));
        let json = serde_json::to_value(&api).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("response_format").is_none());
        assert_eq!(json["messages"], serde_json::json!([{"role": "user", "content": "x"}]));
    }

    #[tokio::test]
    async fn chat_sends_bearer_token_to_chat_completions() -> anyhow::Result<()> {
        use wiremock::matchers::{body_partial_json, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "llama-3.3-70b"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 4, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test", format!("{}/v1", server.uri()));
        let resp = provider
            .chat(LlmRequest::simple("llama-3.3-70b".into(), Some("be brief".into()), "hi".into()))
            .await?;
        assert_eq!(resp.text, "hello");
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(resp.output_tokens, Some(1));
        Ok(())
    }
}
