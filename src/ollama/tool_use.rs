//! Ollama Chat API with tool calling support
//!
//! Client for Ollama's `/api/chat` endpoint plus the helpers that pull a
//! program out of a model reply: native tool calls first, then tool calls
//! written as JSON in the text, then fenced code blocks.

use serde::{Deserialize, Serialize};

/// Name of the single tool offered to the model
pub const RUN_PROGRAM_TOOL: &str = "run_program";

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role("tool", content)
    }

    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

/// A tool call from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ollama returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("empty response from Ollama")]
    EmptyResponse,
}

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Send a non-streaming chat request with optional tools
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        tools: Option<&[Tool]>,
    ) -> Result<ChatResponse, ChatError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0
            }
        });

        if let Some(t) = tools {
            body["tools"] = serde_json::to_value(t)?;
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ChatError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        Ok(serde_json::from_str(&text)?)
    }

    /// The run_program tool definition
    pub fn run_program_tool() -> Tool {
        Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: RUN_PROGRAM_TOOL.to_string(),
                description: "Run a Python program in an isolated sandbox and see its output. \
                    The capability functions listed in the system prompt are already defined \
                    as globals inside the program."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "code": {
                            "type": "string",
                            "description": "Complete Python program to run"
                        }
                    },
                    "required": ["code"]
                }),
            },
        }
    }
}

/// Default system prompt for the program-writing agent
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an assistant that solves tasks by writing Python programs.

Call the run_program tool with a complete Python program. The program runs in an isolated sandbox:
- Files you create go in the shared directory given by the CODEVISOR_SHARED_DIR environment variable
- Uploaded files are readable in CODEVISOR_INPUT_DIR
- The capability functions listed below are predefined globals; call them directly

Guidelines:
- Print what you want to see; only the program output comes back to you
- If a run fails, read the error and fix the program
- Calling a capability marked "agent" or "behavior" ends the program immediately
- When no program is needed, answer in plain text"#;

/// Try to parse tool calls from the response content text
///
/// Handles models that write tool calls as JSON in the text instead of
/// using the native tool_calls field.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let mut tool_calls = Vec::new();
    let content = content.trim();

    if let Some(tool_call) = try_parse_tool_call(content) {
        tool_calls.push(tool_call);
        return tool_calls;
    }

    // Scan for balanced {...} objects
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Some(tool_call) = try_parse_tool_call(&content[s..=i]) {
                            tool_calls.push(tool_call);
                        }
                    }
                    start = None;
                }
            }
            _ => {}
        }
    }

    tool_calls
}

/// Try to parse a single tool call from a JSON string
fn try_parse_tool_call(json_str: &str) -> Option<ToolCall> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str) {
        return parse_tool_call_from_value(&value);
    }

    // LLMs often leave quotes inside the code string unescaped
    let fixed = try_fix_malformed_json(json_str)?;
    let value = serde_json::from_str::<serde_json::Value>(&fixed).ok()?;
    parse_tool_call_from_value(&value)
}

/// Escape unescaped double quotes inside a `"code": "..."` value
fn try_fix_malformed_json(json_str: &str) -> Option<String> {
    let code_marker = "\"code\": \"";
    let code_start = json_str.find(code_marker)?;
    let code_value_start = code_start + code_marker.len();

    let remaining = &json_str[code_value_start..];
    let end_pattern = remaining.rfind("\"}}")?;
    let code_content = &remaining[..end_pattern];

    let escaped_code = code_content
        .replace("\\\"", "\u{FFFF}")
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"");

    let prefix = &json_str[..code_value_start];
    let suffix = &json_str[code_value_start + end_pattern..];

    Some(format!("{}{}{}", prefix, escaped_code, suffix))
}

/// Parse a tool call from `{"name": ..., "arguments"|"parameters": {...}}`
fn parse_tool_call_from_value(value: &serde_json::Value) -> Option<ToolCall> {
    let name = value.get("name").and_then(|n| n.as_str())?;

    let arguments = match (value.get("arguments"), value.get("parameters")) {
        (Some(args), _) => args.clone(),
        // Some models mix the schema into the values: {"code": {"value": "..."}}
        (None, Some(params)) => match params.get("code") {
            Some(code) if code.is_object() => serde_json::json!({
                "code": code.get("value").and_then(|v| v.as_str()).unwrap_or("")
            }),
            _ => params.clone(),
        },
        (None, None) => return None,
    };

    Some(ToolCall {
        function: FunctionCall {
            name: name.to_string(),
            arguments,
        },
    })
}

/// Program from a run_program tool call
pub fn program_from_tool_call(call: &ToolCall) -> Option<String> {
    if call.function.name != RUN_PROGRAM_TOOL {
        return None;
    }
    let arguments = &call.function.arguments;
    // Arguments occasionally arrive as a JSON-encoded string
    let code = match arguments {
        serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
            .ok()?
            .get("code")?
            .as_str()?
            .to_string(),
        other => other.get("code")?.as_str()?.to_string(),
    };
    Some(code)
}

/// First fenced ```python (or untagged) code block in `content`
pub fn extract_fenced_program(content: &str) -> Option<String> {
    let mut rest = content;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let line_end = after.find('\n')?;
        let tag = after[..line_end].trim().to_ascii_lowercase();
        let body = &after[line_end + 1..];
        let close = body.find("```")?;
        if tag.is_empty() || tag == "python" || tag == "py" || tag == "python3" {
            return Some(body[..close].to_string());
        }
        rest = &body[close + 3..];
    }
    None
}
