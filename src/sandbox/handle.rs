//! Sandbox handle - one isolated environment bound to one conversation
//!
//! Lifecycle: Ready -> Running -> Ready ... -> Killed/Destroyed
//!
//! A handle is shared (`Arc`) between the governor, the task driving the
//! current run and the deadline path that may kill it, so its mutable state
//! sits behind atomics and a small mutex.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::conversation::ConversationKey;

/// Status of a sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxStatus {
    /// Created, not running anything
    Ready,
    /// A run is in progress
    Running,
    /// Forcibly terminated; never reused
    Killed,
    /// Resources released
    Destroyed,
    Failed(String),
}

pub struct SandboxHandle {
    pub sandbox_id: String,
    pub conversation_key: ConversationKey,
    /// Host directory owning everything this sandbox writes
    pub root_dir: PathBuf,
    /// Host side of the read-write shared area
    pub shared_dir: PathBuf,
    /// Host side of the read-only input area
    pub input_dir: PathBuf,
    /// Where the shared area appears to the program
    pub guest_shared_dir: PathBuf,
    /// Where the input area appears to the program
    pub guest_input_dir: PathBuf,
    /// Container id, for container-backed sandboxes
    pub container_id: Option<String>,
    /// Whether a cgroup was created for this sandbox
    pub cgroup: bool,
    pub created_at: Instant,
    status: Mutex<SandboxStatus>,
    /// Process group of the current run, 0 when idle
    process_group: AtomicI32,
}

impl SandboxHandle {
    pub fn new(
        sandbox_id: String,
        conversation_key: ConversationKey,
        root_dir: PathBuf,
        shared_dir: PathBuf,
        input_dir: PathBuf,
    ) -> Self {
        Self {
            sandbox_id,
            conversation_key,
            guest_shared_dir: shared_dir.clone(),
            guest_input_dir: input_dir.clone(),
            root_dir,
            shared_dir,
            input_dir,
            container_id: None,
            cgroup: false,
            created_at: Instant::now(),
            status: Mutex::new(SandboxStatus::Ready),
            process_group: AtomicI32::new(0),
        }
    }

    /// Guest-side paths differ from host paths (container mounts)
    pub fn with_guest_paths(mut self, shared: impl Into<PathBuf>, input: impl Into<PathBuf>) -> Self {
        self.guest_shared_dir = shared.into();
        self.guest_input_dir = input.into();
        self
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_cgroup(mut self, cgroup: bool) -> Self {
        self.cgroup = cgroup;
        self
    }

    pub fn status(&self) -> SandboxStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_status(&self, status: SandboxStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Ready -> Running. False if the sandbox was torn down or is busy.
    pub fn mark_running(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == SandboxStatus::Ready {
            *status = SandboxStatus::Running;
            true
        } else {
            false
        }
    }

    /// Back to Ready after a run, unless the sandbox was killed meanwhile
    pub fn mark_ready(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == SandboxStatus::Running {
            *status = SandboxStatus::Ready;
        }
    }

    pub fn mark_killed(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != SandboxStatus::Destroyed {
            *status = SandboxStatus::Killed;
        }
    }

    pub fn mark_destroyed(&self) {
        self.set_status(SandboxStatus::Destroyed);
    }

    pub fn mark_failed(&self, error: String) {
        self.set_status(SandboxStatus::Failed(error));
    }

    /// Whether a new run may be started in this sandbox
    pub fn is_reusable(&self) -> bool {
        matches!(self.status(), SandboxStatus::Ready)
    }

    pub fn set_process_group(&self, pgid: i32) {
        self.process_group.store(pgid, Ordering::SeqCst);
    }

    pub fn take_process_group(&self) -> Option<i32> {
        match self.process_group.swap(0, Ordering::SeqCst) {
            0 => None,
            pgid => Some(pgid),
        }
    }

    pub fn process_group(&self) -> Option<i32> {
        match self.process_group.load(Ordering::SeqCst) {
            0 => None,
            pgid => Some(pgid),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("sandbox_id", &self.sandbox_id)
            .field("conversation_key", &self.conversation_key)
            .field("root_dir", &self.root_dir)
            .field("container_id", &self.container_id)
            .field("status", &self.status())
            .field("age", &self.age())
            .finish()
    }
}
