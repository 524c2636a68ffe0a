//! [`Drafter`] backed by an Ollama chat model

use async_trait::async_trait;
use tracing::{debug, info_span, Instrument};

use super::tool_use::{
    extract_fenced_program, parse_tool_calls_from_text, program_from_tool_call, ChatClient, ChatMessage,
    FunctionCall, Tool, ToolCall, DEFAULT_SYSTEM_PROMPT, RUN_PROGRAM_TOOL,
};
use crate::agent::{CapabilityListing, Draft, DraftError, DraftRequest, Drafter, Role};

pub struct ChatDrafter {
    client: ChatClient,
    model: String,
    system_prompt: String,
    tools: Vec<Tool>,
}

impl ChatDrafter {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            tools: vec![ChatClient::run_program_tool()],
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Chat transcript for one draft request
    pub fn messages(&self, request: &DraftRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_message(
            &self.system_prompt,
            &request.capabilities,
        ))];

        for entry in &request.history {
            messages.push(match entry.role {
                Role::User => ChatMessage::user(entry.content.clone()),
                Role::Assistant => ChatMessage::assistant(entry.content.clone()),
                Role::Context => ChatMessage::user(format!("[context] {}", entry.content)),
            });
        }

        let task_already_asked = request
            .history
            .last()
            .map(|e| e.role == Role::User && e.content == request.task)
            .unwrap_or(false);
        if !task_already_asked {
            messages.push(ChatMessage::user(request.task.clone()));
        }

        if let Some(previous) = &request.previous {
            let mut call = ChatMessage::assistant("");
            call.tool_calls = Some(vec![ToolCall {
                function: FunctionCall {
                    name: RUN_PROGRAM_TOOL.to_string(),
                    arguments: serde_json::json!({ "code": previous.program }),
                },
            }]);
            messages.push(call);
            messages.push(ChatMessage::tool(previous.error.clone()));
        }
        messages
    }
}

fn system_message(prompt: &str, capabilities: &[CapabilityListing]) -> String {
    let mut out = String::from(prompt);
    if !capabilities.is_empty() {
        out.push_str("\n\nAvailable capabilities:\n");
        for c in capabilities {
            out.push_str(&format!("- {} [{}]", c.name, c.kind));
            if let Some(usage) = &c.usage {
                out.push_str(": ");
                out.push_str(usage);
            }
            out.push('\n');
        }
    }
    out
}

/// Turn a model reply into a draft
pub fn draft_from_reply(message: &ChatMessage) -> Result<Draft, DraftError> {
    let native = message.tool_calls.as_deref().unwrap_or_default();
    if let Some(program) = native.iter().find_map(program_from_tool_call) {
        return Ok(Draft::Program(program));
    }
    if let Some(program) = parse_tool_calls_from_text(&message.content)
        .iter()
        .find_map(program_from_tool_call)
    {
        return Ok(Draft::Program(program));
    }
    if let Some(program) = extract_fenced_program(&message.content) {
        return Ok(Draft::Program(program));
    }
    let text = message.content.trim();
    if text.is_empty() {
        return Err(DraftError::Invalid("empty reply".to_string()));
    }
    Ok(Draft::Answer(text.to_string()))
}

#[async_trait]
impl Drafter for ChatDrafter {
    fn model(&self) -> &str {
        &self.model
    }

    async fn draft(&self, request: &DraftRequest) -> Result<Draft, DraftError> {
        let span = info_span!("llm_call", model = %self.model, attempt = request.attempt);
        let messages = self.messages(request);
        let response = self
            .client
            .chat(&messages, &self.model, Some(&self.tools))
            .instrument(span)
            .await
            .map_err(|e| DraftError::Backend(e.to_string()))?;
        debug!(
            eval_count = response.eval_count,
            has_tool_calls = response.message.tool_calls.is_some(),
            "model replied"
        );
        draft_from_reply(&response.message)
    }
}
