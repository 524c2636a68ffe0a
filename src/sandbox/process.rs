//! Process-backed sandboxes
//!
//! Each run is an interpreter child process:
//!
//! ```text
//! fork ─► own process group ─► rlimits ─► new netns ─► setgid/setuid ─► clear caps ─► exec interpreter
//!   │
//!   └─ parent: move pid into the sandbox cgroup, stream stdout/stderr into the sink
//! ```
//!
//! Programs run under a dedicated uid that owns nothing but what it is given:
//! the shared area is world-writable, the input area belongs to the host and
//! is read-only to them. The fresh network namespace has no interfaces up, so
//! the only way out is the bridge's Unix socket. Starting the backend without
//! a dedicated uid is refused unless `insecure` is set.
//!
//! The environment is cleared; the program only sees its routing variables
//! and a minimal PATH. Killing a sandbox signals the whole process group so
//! anything the program forked dies with it.

use std::os::unix::process::ExitStatusExt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{geteuid, setgid, setgroups, setuid, Gid, Pid, Uid};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    IsolationBackend, OutputSink, RunExit, SandboxDirs, SandboxError, SandboxHandle, SandboxSpec,
    SandboxStatus,
};
use crate::cgroups::{CgroupManager, ResourceLimits};
use crate::security::CapabilityDropper;
use crate::stub::ProgramBundle;

/// How long to keep draining pipes after the main process exited
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bridge socket, relative to the data directory
pub const BRIDGE_SOCKET: &str = "bridge.sock";

/// Configuration for the process backend
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    pub data_dir: PathBuf,
    /// Interpreter command, the program path is appended
    pub interpreter: Vec<String>,
    pub run_as_uid: Option<u32>,
    pub run_as_gid: Option<u32>,
    /// Try to place sandboxes in cgroups
    pub cgroups: bool,
    /// Allow running without a dedicated uid, sharing the host's user and
    /// network
    pub insecure: bool,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            run_as_uid: None,
            run_as_gid: None,
            cgroups: true,
            insecure: false,
        }
    }
}

/// Identity programs are switched to before exec
#[derive(Debug, Clone, Copy)]
struct Confinement {
    uid: Uid,
    gid: Gid,
}

pub struct ProcessBackend {
    config: ProcessBackendConfig,
    dirs: SandboxDirs,
    /// None if cgroups are unavailable
    cgroup_manager: Option<CgroupManager>,
    limits: std::sync::Mutex<std::collections::HashMap<String, ResourceLimits>>,
    /// None in insecure mode
    confinement: Option<Confinement>,
    bridge_socket: Option<PathBuf>,
}

impl ProcessBackend {
    /// Create the backend
    ///
    /// Fails unless `run_as_uid` names a uid other than the host's or
    /// `insecure` is set. Continues without cgroup limits if the hierarchy
    /// is not writable.
    pub fn new(config: ProcessBackendConfig) -> Result<Self, SandboxError> {
        let host_uid = geteuid().as_raw();
        let confinement = match config.run_as_uid {
            Some(uid) if uid != host_uid => Some(Confinement {
                uid: Uid::from_raw(uid),
                gid: Gid::from_raw(config.run_as_gid.unwrap_or(uid)),
            }),
            _ if config.insecure => {
                warn!(host_uid, "insecure process backend: programs share the host user and network");
                None
            }
            Some(_) => {
                return Err(SandboxError::Insecure(format!(
                    "run_as_uid {} is the host uid",
                    host_uid
                )))
            }
            None => return Err(SandboxError::Insecure("run_as_uid is not set".into())),
        };
        let bridge_socket = match confinement {
            Some(_) => Some(absolute(&config.data_dir)?.join(BRIDGE_SOCKET)),
            None => None,
        };

        let cgroup_manager = if config.cgroups {
            match CgroupManager::new() {
                Ok(m) => {
                    info!("cgroup manager initialized");
                    Some(m)
                }
                Err(e) => {
                    warn!(error = %e, "cgroups unavailable, sandboxes run without cgroup limits");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            dirs: SandboxDirs::new(&config.data_dir),
            config,
            cgroup_manager,
            limits: Default::default(),
            confinement,
            bridge_socket,
        })
    }

    pub fn dirs(&self) -> &SandboxDirs {
        &self.dirs
    }

    fn limits_for(&self, sandbox_id: &str) -> ResourceLimits {
        self.limits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }

    fn build_command(
        &self,
        handle: &SandboxHandle,
        program_path: &std::path::Path,
        program: &ProgramBundle,
    ) -> Result<Command, SandboxError> {
        let (bin, args) = self
            .config
            .interpreter
            .split_first()
            .ok_or_else(|| SandboxError::Run("no interpreter configured".into()))?;

        let mut cmd = Command::new(bin);
        cmd.args(args)
            .arg(program_path)
            .current_dir(&handle.shared_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", &handle.shared_dir)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("CODEVISOR_SHARED_DIR", &handle.guest_shared_dir)
            .env("CODEVISOR_INPUT_DIR", &handle.guest_input_dir)
            .envs(program.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let limits = self.limits_for(&handle.sandbox_id);
        let address_space = limits.memory_bytes as nix::libc::rlim_t;
        let confinement = self.confinement;
        // RLIMIT_NPROC counts every process of the uid, only meaningful for
        // a dedicated sandbox identity
        let nproc = confinement.map(|_| limits.pids_max as nix::libc::rlim_t);
        let dropper = CapabilityDropper::all();

        // SAFETY: the closure runs in the forked child before exec. It only
        // issues setrlimit/unshare/setuid/capset syscalls and touches no
        // shared state.
        unsafe {
            cmd.pre_exec(move || {
                setrlimit(Resource::RLIMIT_AS, address_space, address_space)?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                if let Some(n) = nproc {
                    setrlimit(Resource::RLIMIT_NPROC, n, n)?;
                }
                if let Some(Confinement { uid, gid }) = confinement {
                    // Needs CAP_SYS_ADMIN, so before giving up root
                    unshare(CloneFlags::CLONE_NEWNET)?;
                    dropper.drop_bounding();
                    setgroups(&[gid])?;
                    setgid(gid)?;
                    setuid(uid)?;
                }
                dropper.apply()?;
                Ok(())
            });
        }

        Ok(cmd)
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

async fn pump<R>(mut reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "output pipe closed");
                break;
            }
        }
    }
}

fn signal_group(pgid: i32) -> Result<(), Errno> {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn bridge_url(&self, bridge_addr: SocketAddr) -> String {
        match &self.bridge_socket {
            Some(path) => format!("unix://{}", path.display()),
            None => format!("http://{}", bridge_addr),
        }
    }

    fn bridge_socket(&self) -> Option<PathBuf> {
        self.bridge_socket.clone()
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let (root, shared, input) = self
            .dirs
            .prepare(spec)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        let mut cgroup = false;
        if let Some(ref cgroups) = self.cgroup_manager {
            match cgroups.create(&spec.sandbox_id, &spec.limits) {
                Ok(()) => cgroup = true,
                Err(e) => warn!(sandbox_id = %spec.sandbox_id, error = %e, "failed to create cgroup"),
            }
        }
        self.limits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(spec.sandbox_id.clone(), spec.limits.clone());

        debug!(sandbox_id = %spec.sandbox_id, root = %root.display(), cgroup, "process sandbox created");
        Ok(SandboxHandle::new(
            spec.sandbox_id.clone(),
            spec.conversation_key.clone(),
            root,
            shared,
            input,
        )
        .with_cgroup(cgroup))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        program: &ProgramBundle,
        output: &OutputSink,
    ) -> Result<RunExit, SandboxError> {
        let program_path = self.dirs.write_program(&handle.shared_dir, program).await?;
        let mut cmd = self.build_command(handle, &program_path, program)?;

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Run(format!("failed to start interpreter: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Run("child exited before it could be tracked".into()))?;
        handle.set_process_group(pid as i32);
        // A teardown that landed before the group was recorded found nothing
        // to kill
        if matches!(handle.status(), SandboxStatus::Killed | SandboxStatus::Destroyed) {
            if let Some(pgid) = handle.take_process_group() {
                debug!(sandbox_id = %handle.sandbox_id, pgid, "sandbox torn down while starting");
                if let Err(e) = signal_group(pgid) {
                    debug!(pgid, error = %e, "failed to signal late process group");
                }
            }
        }

        if handle.cgroup {
            if let Some(ref cgroups) = self.cgroup_manager {
                if let Err(e) = cgroups.add_process(&handle.sandbox_id, pid) {
                    warn!(sandbox_id = %handle.sandbox_id, pid, error = %e, "failed to add process to cgroup");
                }
            }
        }

        let stdout = child.stdout.take().map(|r| tokio::spawn(pump(r, output.clone())));
        let stderr = child.stderr.take().map(|r| tokio::spawn(pump(r, output.clone())));

        let status = child.wait().await.map_err(|e| SandboxError::Run(e.to_string()))?;

        // Reap anything the program left running in its group
        if let Some(pgid) = handle.take_process_group() {
            if let Err(e) = signal_group(pgid) {
                debug!(pgid, error = %e, "failed to signal leftover processes");
            }
        }

        for reader in [stdout, stderr].into_iter().flatten() {
            if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(sandbox_id = %handle.sandbox_id, "output pipe still open after exit");
            }
        }

        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => RunExit::code(code),
            (None, Some(sig)) => RunExit::signaled(sig),
            (None, None) => RunExit::default(),
        })
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.mark_killed();
        if let Some(pgid) = handle.take_process_group() {
            signal_group(pgid).map_err(|e| SandboxError::Kill(e.to_string()))?;
            debug!(sandbox_id = %handle.sandbox_id, pgid, "process group killed");
        }
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if let Err(e) = self.kill(handle).await {
            warn!(sandbox_id = %handle.sandbox_id, error = %e, "kill before destroy failed");
        }

        if handle.cgroup {
            if let Some(ref cgroups) = self.cgroup_manager {
                if let Err(e) = cgroups.destroy(&handle.sandbox_id) {
                    warn!(sandbox_id = %handle.sandbox_id, error = %e, "failed to remove cgroup");
                }
            }
        }
        self.limits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&handle.sandbox_id);

        self.dirs.remove(&handle.sandbox_id).await?;
        handle.mark_destroyed();
        debug!(sandbox_id = %handle.sandbox_id, "process sandbox destroyed");
        Ok(())
    }
}
