//! Security primitives for sandboxed execution
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Sandbox child (forked, before exec)                         │
//! │    1. own process group        killpg reaches every child    │
//! │    2. uid/gid drop             non-privileged identity       │
//! │    3. rlimits                  address space, process count  │
//! │    4. capability clear         no root powers left           │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  RPC bridge                                                  │
//! │    per-sandbox token bucket    a looping program cannot      │
//! │                                flood host capabilities       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod capabilities;
pub mod rate_limit;

pub use capabilities::{get_current_caps, CapabilityDropper};
pub use rate_limit::{KeyedRateLimiter, RateLimitError, RateLimiter};
