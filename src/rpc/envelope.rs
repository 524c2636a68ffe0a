//! Wire format shared by the bridge, the generated stubs and [`CapabilityClient`](super::CapabilityClient)
//!
//! ```text
//! POST /v1/call
//! x-codevisor-sandbox-id: sbx-...
//! x-codevisor-conversation-key: <hex of the UTF-8 key>
//! x-codevisor-run-id: run-...
//!
//! {"capability_name": "tool_echo", "args": [...], "kwargs": {...}}
//!
//! 200 OK
//! x-codevisor-error: 0 | 1
//! x-codevisor-method-kind: tool | agent | behavior
//!
//! {"value": ..., "error": null | "message"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation::ConversationKey;

pub const CALL_PATH: &str = "/v1/call";

pub const HEADER_SANDBOX_ID: &str = "x-codevisor-sandbox-id";
pub const HEADER_CONVERSATION_KEY: &str = "x-codevisor-conversation-key";
pub const HEADER_RUN_ID: &str = "x-codevisor-run-id";
pub const HEADER_ERROR: &str = "x-codevisor-error";
pub const HEADER_METHOD_KIND: &str = "x-codevisor-method-kind";

/// Header form of a conversation key
///
/// Keys are opaque UTF-8 and header values are not, so keys travel hex-encoded.
pub fn encode_key_header(key: &ConversationKey) -> String {
    hex::encode(key.as_str().as_bytes())
}

pub fn decode_key_header(value: &str) -> Option<ConversationKey> {
    let bytes = hex::decode(value).ok()?;
    String::from_utf8(bytes).ok().map(ConversationKey::new)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub capability_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(value: Value) -> Self {
        Self { value, error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
