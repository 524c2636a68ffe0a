//! codevisor - sandboxed program execution for AI agents
//!
//! An agent acts by writing a short program. The program runs inside an
//! isolated, ephemeral sandbox and calls host capabilities through
//! generated stubs as if they were local functions. Failures flow back
//! into the agent's next draft.
//!
//! # Modules
//!
//! - `capability` - registry of host capabilities (tool, agent, behavior)
//! - `stub` - capability stubs and routing injected into every program
//! - `sandbox` - isolation backends (process, docker) and output capture
//! - `governor` - admission control, deadlines, sandbox recycling, audit log
//! - `rpc` - HTTP bridge between sandboxes and the registry
//! - `agent` - self-correction loop around a [`agent::Drafter`]
//! - `ollama` - Ollama-backed drafter
//! - `cgroups` - cgroup v2 ceilings for process sandboxes
//! - `security` - capability dropping and rate limiting
//! - `metrics` - Prometheus metrics
//! - `config` / `telemetry` - TOML configuration and tracing setup
//!
//! # Quick Start
//!
//! ```ignore
//! use codevisor::{ConversationKey, ExecutionRequest, Governor};
//!
//! let governor = Governor::new(config, backend, registry, bridge_url);
//! let result = governor
//!     .execute(ExecutionRequest::new(ConversationKey::new("chat-1"), "print(roll_dice('2d6'))"))
//!     .await?;
//! println!("{}", result.output);
//! ```

pub mod agent;
pub mod capability;
pub mod cgroups;
pub mod config;
pub mod conversation;
pub mod governor;
pub mod metrics;
pub mod ollama;
pub mod rpc;
pub mod sandbox;
pub mod security;
pub mod stub;
pub mod telemetry;

pub use capability::{CapabilityRegistry, MethodKind};
pub use cgroups::ResourceLimits;
pub use conversation::ConversationKey;
pub use governor::{ExecutionRequest, ExecutionResult, Governor, GovernorConfig};
