//! The reasoning side of the loop: something that writes programs
//!
//! [`Drafter`] is the seam between the self-correction loop and whatever
//! produces programs, an LLM in production ([`ChatDrafter`](crate::ollama::ChatDrafter))
//! or a scripted sequence in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityDescriptor, MethodKind};

/// A capability as presented to the drafter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityListing {
    pub name: String,
    pub kind: MethodKind,
    pub usage: Option<String>,
}

impl From<&CapabilityDescriptor> for CapabilityListing {
    fn from(d: &CapabilityDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            kind: d.kind,
            usage: d.usage.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Recorded by a behavior capability
    Context,
}

/// One entry of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn context(content: impl Into<String>) -> Self {
        Self { role: Role::Context, content: content.into() }
    }
}

/// The program that failed last, with the error text to learn from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub program: String,
    pub error: String,
}

/// Everything a drafter sees for one attempt
#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub task: String,
    pub capabilities: Vec<CapabilityListing>,
    pub history: Vec<ConversationEntry>,
    /// 0 for the first attempt of a turn
    pub attempt: usize,
    pub previous: Option<FailedAttempt>,
}

/// What the drafter came back with
#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    /// A program to run
    Program(String),
    /// A direct answer, no program needed
    Answer(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("drafter backend error: {0}")]
    Backend(String),
    #[error("drafter returned an unusable response: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait Drafter: Send + Sync {
    /// Label for metrics and logs
    fn model(&self) -> &str {
        "unknown"
    }

    async fn draft(&self, request: &DraftRequest) -> Result<Draft, DraftError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::builtin::builtin_descriptors;

    #[test]
    fn test_listing_from_descriptor() {
        let descriptors = builtin_descriptors();
        let echo = descriptors.iter().find(|d| d.name == "tool_echo").unwrap();
        let listing = CapabilityListing::from(echo);
        assert_eq!(listing.kind, MethodKind::Tool);
        assert!(listing.usage.is_some());
    }

    #[test]
    fn test_role_serialization() {
        let entry = ConversationEntry::context("timer set");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["role"], "context");
    }
}
