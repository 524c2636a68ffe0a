//! Agent module: the self-correction loop
//!
//! # Architecture
//!
//! ```text
//! Task → AgentController ── DraftRequest ──► Drafter (ChatDrafter → Ollama /api/chat)
//!              │                                  │
//!              │◄──────────── Draft::Program ─────┘
//!              ▼
//!        Governor.execute() → sandbox runs stubs + program
//!              │                    │
//!              │                    └─ capability calls → RPC Bridge → Registry
//!              ▼
//!        ExecutionResult
//!              ├─ success, no short-circuit ... Completed
//!              ├─ agent capability called ...... HandOff (new turn)
//!              ├─ behavior capability called ... ContextRecorded
//!              └─ failure ...................... feed error back, retry or GaveUp
//! ```

pub mod controller;
pub mod drafter;

pub use controller::{
    failure_feedback, AgentConfig, AgentController, ConversationReport, TurnOutcome, TurnState,
};
pub use drafter::{
    CapabilityListing, ConversationEntry, Draft, DraftError, DraftRequest, Drafter, FailedAttempt, Role,
};
