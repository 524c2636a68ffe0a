//! Per-conversation sandbox slots
//!
//! ```text
//! SandboxArena
//! └── std Mutex<HashMap<ConversationKey, Arc<tokio Mutex<KeyState>>>>
//!                                             │
//!                KeyState ◄───────────────────┘
//!                ├── sandbox      at most one live sandbox for the key
//!                ├── generation   bumped on every replacement
//!                ├── busy         a run is in progress
//!                └── cleanup      pending deferred teardown
//! ```
//!
//! The outer map lock is only held for lookups. Everything that awaits
//! (create, kill, destroy) happens under the per-key async lock, so runs of
//! different conversations never wait on each other here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

use crate::conversation::ConversationKey;
use crate::sandbox::SandboxHandle;

pub type Slot = Arc<tokio::sync::Mutex<KeyState>>;

pub struct KeyState {
    pub sandbox: Option<Arc<SandboxHandle>>,
    pub generation: u64,
    pub busy: bool,
    pub last_active: Instant,
    cleanup: Option<AbortHandle>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            sandbox: None,
            generation: 0,
            busy: false,
            last_active: Instant::now(),
            cleanup: None,
        }
    }

    /// Abort a pending deferred teardown, if any
    pub fn cancel_cleanup(&mut self) -> bool {
        match self.cleanup.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn set_cleanup(&mut self, handle: AbortHandle) {
        self.cancel_cleanup();
        self.cleanup = Some(handle);
    }

    /// Forget the cleanup handle without aborting it (called by the cleanup itself)
    pub fn clear_cleanup(&mut self) {
        self.cleanup = None;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

#[derive(Default)]
pub struct SandboxArena {
    slots: Mutex<HashMap<ConversationKey, Slot>>,
}

impl SandboxArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `key`, created empty on first use
    pub fn slot(&self, key: &ConversationKey) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(KeyState::new())))
            .clone()
    }

    pub fn get(&self, key: &ConversationKey) -> Option<Slot> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn entries(&self) -> Vec<(ConversationKey, Slot)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drop the map entry for `key` if nobody but the caller holds `slot`
    ///
    /// New holders can only be created through the map, under the same lock,
    /// so the count check cannot race. The caller must have released the
    /// slot's inner lock and seen it empty.
    pub fn release_if_unused(&self, key: &ConversationKey, slot: &Slot) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = match slots.get(key) {
            // map + caller
            Some(current) => Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2,
            None => false,
        };
        if unused {
            if let Ok(state) = slot.try_lock() {
                if state.sandbox.is_none() && !state.busy {
                    drop(state);
                    slots.remove(key);
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_same_slot() {
        let arena = SandboxArena::new();
        let key = ConversationKey::new("k");
        let a = arena.slot(&key);
        let b = arena.slot(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &arena.slot(&ConversationKey::new("other"))));
    }

    #[tokio::test]
    async fn test_release_only_when_unused() {
        let arena = SandboxArena::new();
        let key = ConversationKey::new("k");
        let slot = arena.slot(&key);
        let other = arena.slot(&key);
        assert!(!arena.release_if_unused(&key, &slot));
        drop(other);
        assert!(arena.release_if_unused(&key, &slot));
        assert!(arena.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_busy_slot() {
        let arena = SandboxArena::new();
        let key = ConversationKey::new("k");
        let slot = arena.slot(&key);
        slot.lock().await.busy = true;
        assert!(!arena.release_if_unused(&key, &slot));
        assert_eq!(arena.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_cleanup_aborts_task() {
        let arena = SandboxArena::new();
        let slot = arena.slot(&ConversationKey::new("k"));
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let mut state = slot.lock().await;
        state.set_cleanup(task.abort_handle());
        assert!(state.cancel_cleanup());
        assert!(!state.cancel_cleanup());
        drop(state);
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
