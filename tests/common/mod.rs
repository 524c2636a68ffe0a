//! Shared test harness
//!
//! [`ScriptedBackend`] stands in for a real isolation backend. A program body
//! is a list of commands, one per line, played by an in-process runner that
//! talks to the bridge over HTTP with the crate's own [`CapabilityClient`]:
//!
//! ```text
//! print <text>            write a line of output
//! call <name> [json args] call a capability, print its value
//! sleep <ms>              sleep, unless the sandbox is killed first
//! spam <n>                write n characters
//! exit <code>             stop with an exit code
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use codevisor::agent::{Draft, DraftError, DraftRequest, Drafter};
use codevisor::capability::{register_builtins, CapabilityRegistry};
use codevisor::governor::{Governor, GovernorConfig};
use codevisor::rpc::{Bridge, BridgeConfig, CallOutcome, CapabilityClient, ClientError};
use codevisor::sandbox::{
    IsolationBackend, OutputSink, RunExit, SandboxError, SandboxHandle, SandboxSpec,
};
use codevisor::stub::{ProgramBundle, StubRouting};

const SIGKILL: i32 = 9;

/// In-process isolation backend playing scripted programs
pub struct ScriptedBackend {
    root: PathBuf,
    kill_switches: Mutex<HashMap<String, watch::Sender<bool>>>,
    pub fail_create: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    kills: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct RunningGuard<'a> {
    running: &'a AtomicUsize,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            kill_switches: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most runs ever in progress at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> RunningGuard<'_> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        RunningGuard { running: &self.running }
    }
}

#[async_trait]
impl IsolationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Create("scripted failure".into()));
        }
        let root = self.root.join(&spec.sandbox_id);
        let shared = root.join("shared");
        let input = root.join("input");
        tokio::fs::create_dir_all(&shared).await?;
        tokio::fs::create_dir_all(&input).await?;

        let (tx, _rx) = watch::channel(false);
        self.kill_switches
            .lock()
            .unwrap()
            .insert(spec.sandbox_id.clone(), tx);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle::new(
            spec.sandbox_id.clone(),
            spec.conversation_key.clone(),
            root,
            shared,
            input,
        ))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        program: &ProgramBundle,
        output: &OutputSink,
    ) -> Result<RunExit, SandboxError> {
        let mut killed = self
            .kill_switches
            .lock()
            .unwrap()
            .get(&handle.sandbox_id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| SandboxError::Run("sandbox is gone".into()))?;
        let _guard = self.enter();

        let routing = StubRouting::from_env_vars(program.env.clone())
            .ok_or_else(|| SandboxError::Run("routing variables missing".into()))?;
        let client = CapabilityClient::new(routing).map_err(|e| SandboxError::Run(e.to_string()))?;

        for line in program.body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "print" => output.write_str(&format!("{}\n", rest)),
                "spam" => {
                    let n: usize = rest.parse().unwrap_or(0);
                    output.write_str(&"x".repeat(n));
                }
                "sleep" => {
                    let ms: u64 = rest.parse().unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = killed.wait_for(|k| *k) => return Ok(RunExit::signaled(SIGKILL)),
                    }
                }
                "exit" => return Ok(RunExit::code(rest.parse().unwrap_or(1))),
                "call" => {
                    let (name, args) = rest.split_once(' ').unwrap_or((rest, "[]"));
                    let args: Vec<Value> = serde_json::from_str(args).unwrap_or_default();
                    match client.call(name, args, Map::new()).await {
                        Ok(CallOutcome::Continue(value)) => output.write_str(&format!("{}\n", value)),
                        Ok(CallOutcome::Exit { rendered, .. }) => {
                            output.write_str(&rendered);
                            return Ok(RunExit::code(0));
                        }
                        Err(ClientError::Capability { name, message }) => {
                            output.write_str(&format!("CapabilityCallError: {}: {}\n", name, message));
                            return Ok(RunExit::code(1));
                        }
                        Err(e) => {
                            output.write_str(&format!("BridgeError: {}\n", e));
                            return Ok(RunExit::code(1));
                        }
                    }
                }
                other => {
                    output.write_str(&format!("SyntaxError: unknown command `{}`\n", other));
                    return Ok(RunExit::code(2));
                }
            }
        }
        Ok(RunExit::code(0))
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        handle.mark_killed();
        if let Some(tx) = self.kill_switches.lock().unwrap().get(&handle.sandbox_id) {
            tx.send_replace(true);
        }
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.mark_destroyed();
        if let Some(tx) = self.kill_switches.lock().unwrap().remove(&handle.sandbox_id) {
            tx.send_replace(true);
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        match tokio::fs::remove_dir_all(&handle.root_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Governor + bridge on a loopback port, backed by [`ScriptedBackend`]
pub struct Harness {
    pub registry: Arc<CapabilityRegistry>,
    pub backend: Arc<ScriptedBackend>,
    pub governor: Governor,
    pub bridge_url: String,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    // Dropped last
    pub data: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(GovernorConfig::default()).await
    }

    /// `config.data_dir` is replaced by a scratch directory
    pub async fn with_config(mut config: GovernorConfig) -> Self {
        let data = tempfile::tempdir().unwrap();
        config.data_dir = data.path().to_path_buf();

        let registry = Arc::new(CapabilityRegistry::new());
        register_builtins(&registry).unwrap();

        let backend = Arc::new(ScriptedBackend::new(data.path().join("sandboxes")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bridge_url = backend.bridge_url(addr);

        let governor = Governor::new(config, backend.clone(), registry.clone(), bridge_url.clone());
        let bridge = Bridge::new(registry.clone(), governor.live(), BridgeConfig::default());

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(bridge.serve(listener, async {
            let _ = rx.await;
        }));

        Self {
            registry,
            backend,
            governor,
            bridge_url,
            addr,
            shutdown: Some(tx),
            data,
        }
    }

    /// Wait until `n` runs are in progress
    pub async fn wait_running(&self, n: usize) {
        for _ in 0..500 {
            if self.backend.running() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {} concurrent runs", n);
    }

    pub async fn stop(mut self) {
        self.governor.shutdown().await;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Drafter replaying a fixed list of drafts
pub struct ScriptedDrafter {
    drafts: Mutex<VecDeque<Draft>>,
    requests: Mutex<Vec<DraftRequest>>,
}

impl ScriptedDrafter {
    pub fn new(drafts: Vec<Draft>) -> Self {
        Self {
            drafts: Mutex::new(drafts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn programs(programs: &[&str]) -> Self {
        Self::new(programs.iter().map(|p| Draft::Program(p.to_string())).collect())
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<DraftRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Drafter for ScriptedDrafter {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn draft(&self, request: &DraftRequest) -> Result<Draft, DraftError> {
        self.requests.lock().unwrap().push(request.clone());
        self.drafts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| DraftError::Backend("no drafts left".into()))
    }
}
