//! Shared stubs for strategy unit tests.

use async_trait::async_trait;
use casegraph_core::{CaseGraphError, CompletionRequest, FunctionCall, LlmProvider, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

/// LLM stub that replays a fixed queue of responses.
pub(crate) struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    pub(crate) fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| CaseGraphError::Llm("no scripted response left".to_string()))
    }

    async fn complete_with_functions(
        &self,
        _prompt: &str,
        _functions: &[Value],
        _system_prompt: Option<&str>,
        _temperature: f64,
    ) -> Result<FunctionCall> {
        Err(CaseGraphError::Llm("not scripted".to_string()))
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }
}
