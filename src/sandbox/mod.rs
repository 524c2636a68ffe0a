//! Isolation runtime
//!
//! A sandbox is a short-lived isolated environment bound to one
//! conversation. Backends implement [`IsolationBackend`] so the governor and
//! the RPC bridge never depend on how isolation is achieved:
//!
//! - [`process::ProcessBackend`]: child processes with dropped privileges,
//!   rlimits and cgroup v2 ceilings
//! - [`docker::DockerBackend`]: one container per sandbox via the Docker
//!   Engine API
//!
//! Directory layout shared by both backends:
//!
//! ```text
//! {data_dir}/
//! ├── sandboxes/{sandbox_id}/
//! │   └── shared/              read-write for the program
//! │       └── .codevisor/      materialized program
//! └── uploads/{k-|h-|d-...}/   conversation uploads, read-only for the program
//! ```

pub mod docker;
pub mod handle;
pub mod output;
pub mod process;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::cgroups::ResourceLimits;
use crate::conversation::ConversationKey;
use crate::stub::ProgramBundle;

pub use handle::{SandboxHandle, SandboxStatus};
pub use output::{truncate_output, CapturedOutput, OutputSink, TruncateFrom};

/// Directory inside the shared area holding the materialized program
pub const PROGRAM_DIR: &str = ".codevisor";
pub const PROGRAM_FILE: &str = "program.py";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create sandbox: {0}")]
    Create(String),
    #[error("failed to run program: {0}")]
    Run(String),
    #[error("failed to kill sandbox: {0}")]
    Kill(String),
    #[error("failed to destroy sandbox: {0}")]
    Destroy(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("refusing to start without isolation: {0}")]
    Insecure(String),
}

/// What to create
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub sandbox_id: String,
    pub conversation_key: ConversationKey,
    pub limits: ResourceLimits,
}

/// How a program run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunExit {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl RunExit {
    pub fn code(code: i32) -> Self {
        Self { exit_code: Some(code), signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self { exit_code: None, signal: Some(signal) }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Shell-style status: the exit code, or 128 + signal
    pub fn status_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }
}

/// Narrow interface every isolation backend provides
///
/// `kill` must be idempotent: killing a sandbox whose program already exited
/// (or that is already gone) is `Ok(())`. `destroy` likewise treats missing
/// resources as already released.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bridge URL as reachable from inside a sandbox
    fn bridge_url(&self, bridge_addr: SocketAddr) -> String {
        format!("http://{}", bridge_addr)
    }

    /// Unix socket the bridge must also listen on, for backends whose
    /// sandboxes have no network
    fn bridge_socket(&self) -> Option<PathBuf> {
        None
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Run a program to completion, streaming output into `output`
    ///
    /// Cancel-safe with respect to the host: dropping the future leaves at
    /// most a process the next `kill` reaps.
    async fn run(
        &self,
        handle: &SandboxHandle,
        program: &ProgramBundle,
        output: &OutputSink,
    ) -> Result<RunExit, SandboxError>;

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Host-side directory layout
#[derive(Debug, Clone)]
pub struct SandboxDirs {
    data_dir: PathBuf,
}

impl SandboxDirs {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn sandbox_root(&self, sandbox_id: &str) -> PathBuf {
        self.data_dir.join("sandboxes").join(sandbox_id)
    }

    pub fn uploads(&self, key: &ConversationKey) -> PathBuf {
        self.data_dir.join("uploads").join(key.dir_name())
    }

    /// Create the sandbox tree, returning (root, shared, input)
    pub async fn prepare(&self, spec: &SandboxSpec) -> Result<(PathBuf, PathBuf, PathBuf), SandboxError> {
        let root = self.sandbox_root(&spec.sandbox_id);
        let shared = root.join("shared");
        let input = self.uploads(&spec.conversation_key);

        tokio::fs::create_dir_all(shared.join(PROGRAM_DIR)).await?;
        tokio::fs::create_dir_all(&input).await?;
        set_mode(&shared, 0o777).await?;
        set_mode(&input, 0o755).await?;

        Ok((root, shared, input))
    }

    /// Write the program into the shared area, returning its host path
    pub async fn write_program(&self, shared: &Path, program: &ProgramBundle) -> Result<PathBuf, SandboxError> {
        let path = shared.join(PROGRAM_DIR).join(PROGRAM_FILE);
        tokio::fs::write(&path, program.source.as_bytes()).await?;
        set_mode(&path, 0o644).await?;
        Ok(path)
    }

    /// Remove the sandbox tree. A tree that is already gone is not an error.
    pub async fn remove(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(self.sandbox_root(sandbox_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Destroy(e.to_string())),
        }
    }
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}
