//! Ollama LLM integration
//!
//! - [`tool_use`] - `/api/chat` client with tool calling and reply parsing
//! - [`drafter`] - [`ChatDrafter`], the production [`Drafter`](crate::agent::Drafter)

pub mod drafter;
pub mod tool_use;

pub use drafter::ChatDrafter;
pub use tool_use::{ChatClient, ChatError, ChatMessage, DEFAULT_SYSTEM_PROMPT};
