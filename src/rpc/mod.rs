//! RPC bridge between sandboxed programs and host capabilities
//!
//! - [`bridge`] - axum service dispatching calls to the registry
//! - [`client`] - calling side, for sandbox runners written in Rust
//! - [`envelope`] - request/response bodies and header names

pub mod bridge;
pub mod client;
pub mod envelope;

pub use bridge::{Bridge, BridgeConfig, BridgeError};
pub use client::{CallOutcome, CapabilityClient, ClientError};
pub use envelope::{RpcRequest, RpcResponse};
