//! Index of live sandboxes, consulted by the RPC bridge
//!
//! A sandbox id is authorized exactly while it is in this index. The
//! governor inserts it after creation and removes it before tearing the
//! sandbox down, so a caller holding a stale or guessed id is rejected
//! without touching the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::MethodKind;
use crate::conversation::ConversationKey;
use crate::sandbox::SandboxHandle;

/// A short-circuiting capability call recorded host-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortCircuit {
    pub capability: String,
    pub kind: MethodKind,
    pub value: Value,
}

/// Per-run record of short-circuit calls
#[derive(Debug, Default)]
pub struct RunJournal {
    short_circuit: Mutex<Option<ShortCircuit>>,
}

impl RunJournal {
    /// Record a call. The first one wins: the stub exits right after it.
    pub fn record(&self, entry: ShortCircuit) {
        let mut slot = self.short_circuit.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(entry);
        }
    }

    pub fn take(&self) -> Option<ShortCircuit> {
        self.short_circuit.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    #[error("unknown sandbox")]
    UnknownSandbox,
    #[error("conversation key does not match sandbox")]
    KeyMismatch,
    #[error("no such run in progress")]
    StaleRun,
}

impl LiveError {
    pub fn reason(&self) -> &'static str {
        match self {
            LiveError::UnknownSandbox => "unknown_sandbox",
            LiveError::KeyMismatch => "key_mismatch",
            LiveError::StaleRun => "stale_run",
        }
    }
}

struct ActiveRun {
    run_id: String,
    journal: Arc<RunJournal>,
}

struct LiveEntry {
    handle: Arc<SandboxHandle>,
    run: Option<ActiveRun>,
}

/// What an authorized caller is allowed to act on
#[derive(Debug, Clone)]
pub struct Authorized {
    pub handle: Arc<SandboxHandle>,
    pub run_id: String,
    pub journal: Arc<RunJournal>,
}

#[derive(Default)]
pub struct LiveSandboxes {
    entries: RwLock<HashMap<String, LiveEntry>>,
}

impl LiveSandboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<SandboxHandle>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.sandbox_id.clone(), LiveEntry { handle, run: None });
    }

    /// Revoke a sandbox id. Returns whether it was live.
    pub fn remove(&self, sandbox_id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sandbox_id)
            .is_some()
    }

    pub fn contains(&self, sandbox_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(sandbox_id)
    }

    /// Open the journal for a new run in this sandbox
    pub fn begin_run(&self, sandbox_id: &str, run_id: &str) -> Option<Arc<RunJournal>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(sandbox_id)?;
        let journal = Arc::new(RunJournal::default());
        entry.run = Some(ActiveRun {
            run_id: run_id.to_string(),
            journal: journal.clone(),
        });
        Some(journal)
    }

    /// Close the run; later calls carrying its id are stale
    pub fn end_run(&self, sandbox_id: &str, run_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(sandbox_id) {
            if entry.run.as_ref().map(|r| r.run_id == run_id).unwrap_or(false) {
                entry.run = None;
            }
        }
    }

    /// Check a caller's claimed identity
    pub fn authorize(
        &self,
        sandbox_id: &str,
        conversation_key: &ConversationKey,
        run_id: &str,
    ) -> Result<Authorized, LiveError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(sandbox_id).ok_or(LiveError::UnknownSandbox)?;
        if &entry.handle.conversation_key != conversation_key {
            return Err(LiveError::KeyMismatch);
        }
        match &entry.run {
            Some(run) if run.run_id == run_id => Ok(Authorized {
                handle: entry.handle.clone(),
                run_id: run.run_id.clone(),
                journal: run.journal.clone(),
            }),
            _ => Err(LiveError::StaleRun),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(id: &str, key: &str) -> Arc<SandboxHandle> {
        Arc::new(SandboxHandle::new(
            id.into(),
            ConversationKey::new(key),
            "/tmp/r".into(),
            "/tmp/r/shared".into(),
            "/tmp/u".into(),
        ))
    }

    #[test]
    fn test_authorize_checks_every_claim() {
        let live = LiveSandboxes::new();
        live.insert(handle("sbx-1", "alice"));
        live.begin_run("sbx-1", "run-1").unwrap();

        let alice = ConversationKey::new("alice");
        assert!(live.authorize("sbx-1", &alice, "run-1").is_ok());
        assert_eq!(
            live.authorize("sbx-x", &alice, "run-1").unwrap_err(),
            LiveError::UnknownSandbox
        );
        assert_eq!(
            live.authorize("sbx-1", &ConversationKey::new("bob"), "run-1").unwrap_err(),
            LiveError::KeyMismatch
        );
        assert_eq!(live.authorize("sbx-1", &alice, "run-0").unwrap_err(), LiveError::StaleRun);
    }

    #[test]
    fn test_removed_sandbox_is_rejected() {
        let live = LiveSandboxes::new();
        live.insert(handle("sbx-1", "alice"));
        live.begin_run("sbx-1", "run-1").unwrap();
        assert!(live.remove("sbx-1"));
        assert!(!live.remove("sbx-1"));
        assert_eq!(
            live.authorize("sbx-1", &ConversationKey::new("alice"), "run-1").unwrap_err(),
            LiveError::UnknownSandbox
        );
    }

    #[test]
    fn test_ended_run_is_stale() {
        let live = LiveSandboxes::new();
        live.insert(handle("sbx-1", "alice"));
        live.begin_run("sbx-1", "run-1").unwrap();
        live.end_run("sbx-1", "run-1");
        assert_eq!(
            live.authorize("sbx-1", &ConversationKey::new("alice"), "run-1").unwrap_err(),
            LiveError::StaleRun
        );
    }

    #[test]
    fn test_journal_keeps_first_short_circuit() {
        let journal = RunJournal::default();
        journal.record(ShortCircuit { capability: "a".into(), kind: MethodKind::Agent, value: json!(1) });
        journal.record(ShortCircuit { capability: "b".into(), kind: MethodKind::Behavior, value: json!(2) });
        assert_eq!(journal.take().unwrap().capability, "a");
        assert!(journal.take().is_none());
    }
}
