//! Capability registry
//!
//! Capabilities are the host-side functions a sandboxed program may call.
//! Each one is registered under an identifier-like name (the symbol the
//! program sees) together with its [`MethodKind`], which decides what the
//! sandbox-side stub does once the call returns:
//!
//! ```text
//! program ──call──► stub ──HTTP──► RPC bridge ──resolve──► registry ──► handler
//!                    ▲                  │
//!                    └── value + kind ──┘
//!
//!   tool      → value returned to the program, execution continues
//!   agent     → value printed in a sentinel, program exits, loop starts a new turn
//!   behavior  → value printed in a sentinel, program exits, loop records context
//! ```

pub mod builtin;
pub mod registry;

use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation::ConversationKey;

pub use builtin::register_builtins;
pub use registry::{CapabilityRegistry, RegistryError, DEFAULT_SOURCE};

/// How control flows after a capability call returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    /// Result is handed back to the running program
    Tool,
    /// Result ends the program and seeds a brand-new reasoning turn
    Agent,
    /// Result ends the program and is recorded as conversation context
    Behavior,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Tool => "tool",
            MethodKind::Agent => "agent",
            MethodKind::Behavior => "behavior",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tool" => Some(MethodKind::Tool),
            "agent" => Some(MethodKind::Agent),
            "behavior" | "behaviour" => Some(MethodKind::Behavior),
            _ => None,
        }
    }

    /// Whether the sandboxed program terminates right after the call
    pub fn short_circuits(&self) -> bool {
        !matches!(self, MethodKind::Tool)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error raised by a capability handler
///
/// Never escapes the RPC bridge: it is encoded into the response's error
/// flag and re-raised inside the sandboxed program.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("path outside shared area: {0}")]
    Path(String),
    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for CapabilityError {
    fn from(e: std::io::Error) -> Self {
        CapabilityError::Failed(e.to_string())
    }
}

/// Positional and keyword arguments of one call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallRequest {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Argument by position, falling back to keyword
    pub fn arg(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    pub fn str_arg(&self, index: usize, name: &str) -> Result<&str, CapabilityError> {
        self.arg(index, name)
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::InvalidArguments(format!("`{}` must be a string", name)))
    }
}

/// Implicit context handed to every handler
#[derive(Debug, Clone)]
pub struct CallContext {
    pub conversation_key: ConversationKey,
    pub sandbox_id: String,
    pub run_id: String,
    /// Host-side location of the sandbox's shared area
    pub shared_dir: PathBuf,
    /// Where the shared area appears inside the sandbox
    pub guest_shared_root: PathBuf,
}

impl CallContext {
    /// Translate a path as seen by the sandboxed program into a host path
    ///
    /// Accepts paths relative to the shared area or absolute paths below its
    /// guest mount point. Anything that could leave the shared area is refused.
    pub fn resolve_shared_path(&self, guest_path: &str) -> Result<PathBuf, CapabilityError> {
        let path = Path::new(guest_path);
        let relative = match path.strip_prefix(&self.guest_shared_root) {
            Ok(rest) => rest,
            Err(_) if path.is_absolute() => {
                return Err(CapabilityError::Path(guest_path.to_string()));
            }
            Err(_) => path,
        };

        let mut resolved = self.shared_dir.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(CapabilityError::Path(guest_path.to_string())),
            }
        }
        Ok(resolved)
    }

    /// Resolve a path that must exist, following symlinks
    ///
    /// The real location has to stay inside the shared area; a link the
    /// program planted pointing elsewhere is refused.
    pub async fn existing_shared_path(&self, guest_path: &str) -> Result<PathBuf, CapabilityError> {
        let lexical = self.resolve_shared_path(guest_path)?;
        let root = tokio::fs::canonicalize(&self.shared_dir).await?;
        let real = tokio::fs::canonicalize(&lexical).await?;
        if real.starts_with(&root) {
            Ok(real)
        } else {
            Err(CapabilityError::Path(guest_path.to_string()))
        }
    }
}

/// A host-side function callable from sandboxed programs
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn call(&self, request: CallRequest, context: &CallContext) -> Result<Value, CapabilityError>;

    /// Usage text surfaced to the reasoning component
    fn usage(&self) -> Option<&str> {
        None
    }
}

/// Adapter turning an async closure into a [`CapabilityHandler`]
pub struct FnHandler<F> {
    func: F,
    usage: Option<String>,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(CallRequest, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func, usage: None }
    }

    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(CallRequest, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    async fn call(&self, request: CallRequest, context: &CallContext) -> Result<Value, CapabilityError> {
        (self.func)(request, context.clone()).await
    }

    fn usage(&self) -> Option<&str> {
        self.usage.as_deref()
    }
}

/// Shorthand for [`FnHandler::new`]
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(CallRequest, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    FnHandler::new(func)
}

/// Registered capability
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub kind: MethodKind,
    pub usage: Option<String>,
    /// Extension the capability was loaded from
    pub source: String,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, kind: MethodKind, handler: Arc<dyn CapabilityHandler>) -> Self {
        let usage = handler.usage().map(str::to_string);
        Self {
            name: name.into(),
            kind,
            usage,
            source: DEFAULT_SOURCE.to_string(),
            handler,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("has_usage", &self.usage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(shared: &str) -> CallContext {
        CallContext {
            conversation_key: ConversationKey::new("c1"),
            sandbox_id: "sbx-1".to_string(),
            run_id: "run-1".to_string(),
            shared_dir: PathBuf::from(shared),
            guest_shared_root: PathBuf::from("/mnt/shared"),
        }
    }

    #[test]
    fn test_method_kind_parse_and_short_circuit() {
        assert_eq!(MethodKind::parse("TOOL"), Some(MethodKind::Tool));
        assert_eq!(MethodKind::parse("behaviour"), Some(MethodKind::Behavior));
        assert_eq!(MethodKind::parse("nope"), None);
        assert!(!MethodKind::Tool.short_circuits());
        assert!(MethodKind::Agent.short_circuits());
        assert!(MethodKind::Behavior.short_circuits());
    }

    #[test]
    fn test_method_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&MethodKind::Behavior).unwrap();
        assert_eq!(json, "\"behavior\"");
    }

    #[test]
    fn test_resolve_shared_path() {
        let ctx = context("/srv/sbx/shared");
        assert_eq!(
            ctx.resolve_shared_path("/mnt/shared/out/plot.png").unwrap(),
            PathBuf::from("/srv/sbx/shared/out/plot.png")
        );
        assert_eq!(
            ctx.resolve_shared_path("./report.txt").unwrap(),
            PathBuf::from("/srv/sbx/shared/report.txt")
        );
    }

    #[test]
    fn test_resolve_shared_path_rejects_escape() {
        let ctx = context("/srv/sbx/shared");
        assert!(ctx.resolve_shared_path("../secret").is_err());
        assert!(ctx.resolve_shared_path("/mnt/shared/../../etc/passwd").is_err());
        assert!(ctx.resolve_shared_path("/etc/passwd").is_err());
    }

    #[test]
    fn test_call_request_arg_fallback() {
        let mut kwargs = Map::new();
        kwargs.insert("text".to_string(), Value::from("hello"));
        let req = CallRequest::new(vec![], kwargs);
        assert_eq!(req.str_arg(0, "text").unwrap(), "hello");
        assert!(req.str_arg(1, "other").is_err());
    }

    #[tokio::test]
    async fn test_fn_handler_carries_usage() {
        let handler = handler_fn(|req: CallRequest, _ctx: CallContext| async move {
            Ok(req.args.first().cloned().unwrap_or(Value::Null))
        })
        .with_usage("echo(value)");
        assert_eq!(handler.usage(), Some("echo(value)"));

        let out = handler
            .call(CallRequest::new(vec![Value::from(3)], Map::new()), &context("/tmp"))
            .await
            .unwrap();
        assert_eq!(out, Value::from(3));
    }
}
