//! Scripted provider shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parlgraph_provider::{ContentBlock, LlmProvider, LlmRequest, LlmResponse};

pub(crate) fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        input_tokens: None,
        output_tokens: None,
        stop_reason: Some("end_turn".into()),
    }
}

pub(crate) fn tool_call_response(name: &str, input: serde_json::Value) -> LlmResponse {
    LlmResponse {
        text: String::new(),
        content: vec![ContentBlock::ToolUse {
            id: format!("call_{name}"),
            name: name.to_string(),
            input,
        }],
        input_tokens: None,
        output_tokens: None,
        stop_reason: Some("tool_use".into()),
    }
}

/// Replays queued responses in order and records every request.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<LlmResponse>>>,
    pub(crate) requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(responses: Vec<Result<LlmResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(text_response(t))).collect())
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn request(&self, index: usize) -> LlmRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted response left")))
    }
}
