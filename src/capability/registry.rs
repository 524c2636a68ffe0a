//! Process-wide capability table
//!
//! Read-mostly: resolutions take a shared lock for a map lookup and hand
//! out an `Arc` clone, so a call resolved before a hot-reload keeps running
//! against the descriptor it resolved. Mutations take the exclusive lock
//! only for the map edit itself.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::{CapabilityDescriptor, CapabilityHandler, MethodKind};

/// Source tag for capabilities registered without an explicit origin
pub const DEFAULT_SOURCE: &str = "default";

/// Names the generated stub module defines itself
const STUB_RESERVED: &[&str] = &["CapabilityCallError"];

/// Python keywords cannot be used as function names in the stub
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
    "return", "try", "while", "with", "yield",
];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("capability `{name}` already registered by `{source_name}`")]
    Conflict { name: String, source_name: String },
    #[error("capability `{0}` not found")]
    NotFound(String),
    #[error("invalid capability name `{0}`")]
    InvalidName(String),
}

/// Validate a capability name for use as a stub symbol
///
/// Leading underscores are reserved for stub internals.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start
        || !valid_rest
        || PYTHON_KEYWORDS.contains(&name)
        || STUB_RESERVED.contains(&name)
    {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, Arc<CapabilityDescriptor>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name` in the default source
    pub fn register(
        &self,
        name: &str,
        kind: MethodKind,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<(), RegistryError> {
        self.register_descriptor(CapabilityDescriptor::new(name, kind, handler))
    }

    /// Register a fully described capability
    ///
    /// Fails with [`RegistryError::Conflict`] if the name is taken, whatever
    /// source owns it. Replacing a capability requires an explicit
    /// [`unregister`](Self::unregister) or [`reload_source`](Self::reload_source).
    pub fn register_descriptor(&self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        validate_name(&descriptor.name)?;
        warn_if_undocumented(&descriptor);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&descriptor.name) {
            return Err(RegistryError::Conflict {
                name: descriptor.name.clone(),
                source_name: existing.source.clone(),
            });
        }

        debug!(
            capability = %descriptor.name,
            kind = %descriptor.kind,
            source = %descriptor.source,
            "Capability registered"
        );
        entries.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<CapabilityDescriptor>, RegistryError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Immutable, name-ordered view of every registered capability
    pub fn snapshot(&self) -> Vec<Arc<CapabilityDescriptor>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<CapabilityDescriptor>, RegistryError> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        info!(capability = %name, "Capability unregistered");
        Ok(removed)
    }

    /// Remove every capability loaded from `source`, returning their names
    pub fn purge_source(&self, source: &str) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = entries
            .values()
            .filter(|d| d.source == source)
            .map(|d| d.name.clone())
            .collect();
        for name in &stale {
            entries.remove(name);
        }
        if !stale.is_empty() {
            info!(source = %source, removed = stale.len(), "Purged capabilities");
        }
        stale
    }

    /// Replace everything `source` provides with `descriptors`
    ///
    /// Stale entries of the source are purged first, so capabilities the
    /// extension no longer ships stop being callable. The swap is atomic: on
    /// any conflict the registry is left exactly as it was.
    pub fn reload_source(
        &self,
        source: &str,
        descriptors: Vec<CapabilityDescriptor>,
    ) -> Result<Vec<String>, RegistryError> {
        for descriptor in &descriptors {
            validate_name(&descriptor.name)?;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        next.retain(|_, d| d.source != source);

        let mut loaded = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let descriptor = descriptor.with_source(source);
            if let Some(existing) = next.get(&descriptor.name) {
                return Err(RegistryError::Conflict {
                    name: descriptor.name.clone(),
                    source_name: existing.source.clone(),
                });
            }
            warn_if_undocumented(&descriptor);
            loaded.push(descriptor.name.clone());
            next.insert(descriptor.name.clone(), Arc::new(descriptor));
        }

        *entries = next;
        info!(source = %source, loaded = loaded.len(), "Capability source reloaded");
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn warn_if_undocumented(descriptor: &CapabilityDescriptor) {
    let documented = descriptor
        .usage
        .as_deref()
        .map(|u| !u.trim().is_empty())
        .unwrap_or(false);
    if !documented {
        warn!(
            capability = %descriptor.name,
            source = %descriptor.source,
            "Capability has no usage documentation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{handler_fn, CallContext, CallRequest};
    use serde_json::Value;

    fn echo() -> Arc<dyn CapabilityHandler> {
        Arc::new(
            handler_fn(|req: CallRequest, _ctx: CallContext| async move {
                Ok(req.args.first().cloned().unwrap_or(Value::Null))
            })
            .with_usage("echo(value) -> value"),
        )
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = CapabilityRegistry::new();
        registry.register("echo", MethodKind::Tool, echo()).unwrap();

        let descriptor = registry.resolve("echo").unwrap();
        assert_eq!(descriptor.kind, MethodKind::Tool);
        assert_eq!(descriptor.usage.as_deref(), Some("echo(value) -> value"));
        assert!(matches!(registry.resolve("missing"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let registry = CapabilityRegistry::new();
        registry.register("echo", MethodKind::Tool, echo()).unwrap();
        let err = registry.register("echo", MethodKind::Agent, echo()).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        // First registration wins, nothing silently replaced
        assert_eq!(registry.resolve("echo").unwrap().kind, MethodKind::Tool);
    }

    #[test]
    fn test_undocumented_handler_still_registers() {
        let registry = CapabilityRegistry::new();
        let bare: Arc<dyn CapabilityHandler> =
            Arc::new(handler_fn(|_req: CallRequest, _ctx: CallContext| async { Ok(Value::Null) }));
        registry.register("bare", MethodKind::Tool, bare).unwrap();
        assert!(registry.resolve("bare").unwrap().usage.is_none());
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in ["", "1abc", "with space", "_private", "class", "CapabilityCallError", "a-b"] {
            assert!(
                matches!(validate_name(name), Err(RegistryError::InvalidName(_))),
                "{name} should be rejected"
            );
        }
        assert!(validate_name("tool_echo").is_ok());
    }

    #[test]
    fn test_snapshot_is_sorted_and_detached() {
        let registry = CapabilityRegistry::new();
        registry.register("zeta", MethodKind::Tool, echo()).unwrap();
        registry.register("alpha", MethodKind::Agent, echo()).unwrap();

        let snapshot = registry.snapshot();
        registry.unregister("zeta").unwrap();

        let names: Vec<&str> = snapshot.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reload_purges_removed_capabilities() {
        let registry = CapabilityRegistry::new();
        registry
            .reload_source(
                "plugin:dice",
                vec![
                    CapabilityDescriptor::new("roll", MethodKind::Tool, echo()),
                    CapabilityDescriptor::new("flip", MethodKind::Tool, echo()),
                ],
            )
            .unwrap();
        assert_eq!(registry.len(), 2);

        // Next version of the plugin drops `flip`
        registry
            .reload_source(
                "plugin:dice",
                vec![CapabilityDescriptor::new("roll", MethodKind::Behavior, echo())],
            )
            .unwrap();
        assert!(registry.resolve("flip").is_err());
        assert_eq!(registry.resolve("roll").unwrap().kind, MethodKind::Behavior);
        assert_eq!(registry.resolve("roll").unwrap().source, "plugin:dice");
    }

    #[test]
    fn test_reload_conflict_leaves_registry_unchanged() {
        let registry = CapabilityRegistry::new();
        registry.register("echo", MethodKind::Tool, echo()).unwrap();
        registry
            .reload_source("plugin:a", vec![CapabilityDescriptor::new("one", MethodKind::Tool, echo())])
            .unwrap();

        let err = registry
            .reload_source(
                "plugin:a",
                vec![
                    CapabilityDescriptor::new("two", MethodKind::Tool, echo()),
                    CapabilityDescriptor::new("echo", MethodKind::Tool, echo()),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        assert!(registry.resolve("one").is_ok());
        assert!(registry.resolve("two").is_err());
    }

    #[test]
    fn test_purge_source() {
        let registry = CapabilityRegistry::new();
        registry.register("echo", MethodKind::Tool, echo()).unwrap();
        registry
            .reload_source("plugin:x", vec![CapabilityDescriptor::new("x1", MethodKind::Tool, echo())])
            .unwrap();

        let removed = registry.purge_source("plugin:x");
        assert_eq!(removed, vec!["x1".to_string()]);
        assert!(registry.resolve("echo").is_ok());
    }

    #[test]
    fn test_resolved_descriptor_survives_unregister() {
        let registry = CapabilityRegistry::new();
        registry.register("echo", MethodKind::Tool, echo()).unwrap();
        let held = registry.resolve("echo").unwrap();
        registry.unregister("echo").unwrap();
        assert_eq!(held.name, "echo");
    }
}
