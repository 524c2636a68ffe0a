//! Execution Governor
//!
//! Admission control, deadlines and sandbox recycling for program runs.
//!
//! ```text
//! execute(request)
//!   │
//!   ├─ acquire slot ............ global ceiling of N concurrent runs (FIFO wait)
//!   ├─ claim sandbox ........... reuse the key's idle sandbox, or invalidate
//!   │                            the old one and create a fresh one
//!   ├─ materialize program ..... stub preamble + body, routing via env
//!   ├─ run with deadline ....... on expiry: kill (idempotent), keep partial output
//!   ├─ release slot
//!   ├─ release sandbox ......... schedule deferred idle cleanup, or tear down
//!   │                            now if killed, failed or too old
//!   └─ audit + metrics
//! ```
//!
//! Every failure below the self-correction loop ends here as either an
//! [`ExecutionResult`] with a marker in its output or a [`GovernorError`].

pub mod arena;
pub mod audit;
pub mod live;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use self::arena::{SandboxArena, Slot};
use self::audit::{AuditLog, AuditRecord};
use crate::capability::CapabilityRegistry;
use crate::cgroups::ResourceLimits;
use crate::conversation::ConversationKey;
use crate::metrics::{
    LIVE_SANDBOXES, RUNNING_EXECUTIONS, RUNS_TOTAL, RUN_DURATION, SANDBOXES_CREATED,
    SANDBOXES_DESTROYED, SLOT_WAIT,
};
use crate::sandbox::{
    IsolationBackend, OutputSink, RunExit, SandboxError, SandboxHandle, SandboxSpec, SandboxStatus,
    TruncateFrom,
};
use crate::stub::{StubGenerator, StubRouting};

pub use self::live::{Authorized, LiveError, LiveSandboxes, RunJournal, ShortCircuit};

pub const REPLACED_MARKER: &str = "\n[terminated: sandbox was replaced by a newer run]";

/// Governor settings
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_concurrent_runs: usize,
    pub run_timeout: Duration,
    /// Idle time after a run before its sandbox is torn down
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Background sweep threshold, a safety net for missed cleanups
    pub max_idle: Duration,
    /// Sandboxes older than this are torn down right after their run
    pub max_sandbox_age: Duration,
    pub output_limit: usize,
    pub truncate_from: TruncateFrom,
    /// Give up waiting for a slot after this long (`None` waits forever)
    pub admission_timeout: Option<Duration>,
    pub limits: ResourceLimits,
    pub data_dir: PathBuf,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            run_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(1800),
            max_sandbox_age: Duration::from_secs(3600),
            output_limit: 8000,
            truncate_from: TruncateFrom::Start,
            admission_timeout: None,
            limits: ResourceLimits::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// No execution slot became free in time
    #[error("admission failed: {0}")]
    Admission(String),
    #[error("sandbox creation failed: {0}")]
    SandboxCreation(String),
    #[error("governor is shut down")]
    Closed,
}

/// One program to run for one conversation
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub conversation_key: ConversationKey,
    pub program: String,
    /// Overrides the configured output limit
    pub output_limit: Option<usize>,
    /// Overrides the configured deadline
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(conversation_key: ConversationKey, program: impl Into<String>) -> Self {
        Self {
            conversation_key,
            program: program.into(),
            output_limit: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = Some(limit);
        self
    }
}

/// Why a run did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ProgramError,
    Timeout,
    Replaced,
    SandboxError,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::ProgramError => "program_error",
            FailureClass::Timeout => "timeout",
            FailureClass::Replaced => "replaced",
            FailureClass::SandboxError => "sandbox_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub conversation_key: ConversationKey,
    pub sandbox_id: String,
    /// Bounded combined output, markers included
    pub output: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub failure: Option<FailureClass>,
    pub truncated_chars: usize,
    /// Short-circuiting capability call recorded by the bridge
    pub short_circuit: Option<ShortCircuit>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Point-in-time view of governor load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GovernorStats {
    pub live_sandboxes: usize,
    pub running: usize,
    pub free_slots: usize,
    pub max_concurrent: usize,
}

/// Runs gauge + counter for the duration of a run
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        RUNNING_EXECUTIONS.inc();
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        RUNNING_EXECUTIONS.dec();
    }
}

struct Inner {
    config: GovernorConfig,
    backend: Arc<dyn IsolationBackend>,
    stubs: StubGenerator,
    arena: SandboxArena,
    live: Arc<LiveSandboxes>,
    slots: Arc<Semaphore>,
    audit: AuditLog,
    bridge_url: String,
    closed: AtomicBool,
    running: AtomicUsize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share all state
#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    /// `bridge_url` is where sandboxed programs reach the RPC bridge
    pub fn new(
        config: GovernorConfig,
        backend: Arc<dyn IsolationBackend>,
        registry: Arc<CapabilityRegistry>,
        bridge_url: impl Into<String>,
    ) -> Self {
        let bridge_url = bridge_url.into();
        info!(
            backend = backend.name(),
            max_concurrent = config.max_concurrent_runs,
            run_timeout_secs = config.run_timeout.as_secs_f64(),
            bridge_url = %bridge_url,
            "execution governor ready"
        );
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrent_runs)),
                audit: AuditLog::new(&config.data_dir),
                config,
                backend,
                stubs: StubGenerator::new(registry),
                arena: SandboxArena::new(),
                live: Arc::new(LiveSandboxes::new()),
                bridge_url,
                closed: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Live-sandbox index for the RPC bridge
    pub fn live(&self) -> Arc<LiveSandboxes> {
        self.inner.live.clone()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Run one program
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, GovernorError> {
        let run_id = format!("run-{}", Uuid::now_v7());
        let span = info_span!(
            "sandbox_run",
            conversation_key = %request.conversation_key,
            run_id = %run_id,
            sandbox_id = tracing::field::Empty,
        );
        let result = self.inner.execute(request, run_id).instrument(span).await;
        if result.is_err() {
            RUNS_TOTAL.with_label_values(&["admission_error"]).inc();
        }
        result
    }

    /// Start the background idle sweep
    pub fn start_sweeper(&self) {
        let inner = self.inner.clone();
        let every = inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let swept = inner.sweep().await;
                if swept > 0 {
                    info!(swept, "idle sandboxes reclaimed");
                }
            }
        });

        let mut sweeper = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
    }

    /// Run one sweep pass now, returning how many sandboxes were reclaimed
    pub async fn sweep_now(&self) -> usize {
        self.inner.sweep().await
    }

    /// Refuse new runs and tear down every sandbox
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.slots.close();
        if let Some(sweeper) = inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }

        let mut destroyed = 0;
        for (key, slot) in inner.arena.entries() {
            let mut state = slot.lock().await;
            state.cancel_cleanup();
            if let Some(handle) = state.sandbox.take() {
                state.generation += 1;
                inner.teardown(&handle, "shutdown").await;
                destroyed += 1;
            }
            drop(state);
            inner.arena.release_if_unused(&key, &slot);
        }
        info!(destroyed, "execution governor shut down");
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            live_sandboxes: self.inner.live.len(),
            running: self.inner.running.load(Ordering::SeqCst),
            free_slots: self.inner.slots.available_permits(),
            max_concurrent: self.inner.config.max_concurrent_runs,
        }
    }
}

impl Inner {
    async fn execute(
        self: &Arc<Self>,
        request: ExecutionRequest,
        run_id: String,
    ) -> Result<ExecutionResult, GovernorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GovernorError::Closed);
        }

        // 1. Admission
        let wait_start = Instant::now();
        let acquire = self.slots.clone().acquire_owned();
        let permit = match self.config.admission_timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(GovernorError::Closed),
                Err(_) => {
                    return Err(GovernorError::Admission(format!(
                        "no execution slot free within {}s",
                        limit.as_secs_f64()
                    )))
                }
            },
            None => acquire.await.map_err(|_| GovernorError::Closed)?,
        };
        SLOT_WAIT.observe(wait_start.elapsed().as_secs_f64());
        let running = RunningGuard::new(&self.running);

        let started_at = Utc::now();
        let clock = Instant::now();
        let key = request.conversation_key.clone();

        // 2. Sandbox for this key
        let slot = self.arena.slot(&key);
        let (handle, generation) = self.claim(&slot, &key).await?;
        tracing::Span::current().record("sandbox_id", handle.sandbox_id.as_str());

        // 3. Program with per-run routing
        let routing = StubRouting {
            bridge_url: self.bridge_url.clone(),
            conversation_key: key.clone(),
            sandbox_id: handle.sandbox_id.clone(),
            run_id: run_id.clone(),
        };
        let bundle = self.stubs.materialize(&request.program, &routing);
        let journal = self
            .live
            .begin_run(&handle.sandbox_id, &run_id)
            .unwrap_or_default();
        // A newer run for the key may have torn the sandbox down since claim
        let started = handle.mark_running();

        // 4. Run under the deadline
        let sink = OutputSink::new(
            request.output_limit.unwrap_or(self.config.output_limit),
            self.config.truncate_from,
        );
        let deadline = request.timeout.unwrap_or(self.config.run_timeout);
        let outcome = if started {
            Some(tokio::time::timeout(deadline, self.backend.run(&handle, &bundle, &sink)).await)
        } else {
            debug!(sandbox_id = %handle.sandbox_id, "sandbox torn down before the run started");
            None
        };

        let (exit, timed_out, run_error): (Option<RunExit>, bool, Option<SandboxError>) = match outcome {
            None => (None, false, None),
            Some(Ok(Ok(exit))) => (Some(exit), false, None),
            Some(Ok(Err(e))) => (None, false, Some(e)),
            Some(Err(_)) => {
                warn!(deadline_secs = deadline.as_secs_f64(), "run exceeded deadline, killing sandbox");
                if let Err(e) = self.backend.kill(&handle).await {
                    warn!(error = %e, "failed to kill timed-out sandbox");
                }
                (None, true, None)
            }
        };
        // Slot is released whether or not the kill succeeded
        drop(permit);
        drop(running);
        self.live.end_run(&handle.sandbox_id, &run_id);

        // 5. Output and markers
        let captured = sink.finish();
        let replaced = !started
            || (!timed_out && matches!(handle.status(), SandboxStatus::Killed | SandboxStatus::Destroyed));
        let mut output = bundle.remap_line_numbers(&captured.text);
        let failure = if replaced {
            output.push_str(REPLACED_MARKER);
            Some(FailureClass::Replaced)
        } else if timed_out {
            output.push_str(&format!(
                "\n[terminated due to timeout after {}s]",
                deadline.as_secs_f64()
            ));
            Some(FailureClass::Timeout)
        } else if let Some(ref e) = run_error {
            warn!(error = %e, "sandbox failed to run program");
            handle.mark_failed(e.to_string());
            output.push_str(&format!("\n[sandbox error: {}]", e));
            Some(FailureClass::SandboxError)
        } else {
            match exit {
                Some(exit) if !exit.success() => {
                    output.push_str(&format!("\n[process exited with code {}]", exit.status_code()));
                    Some(FailureClass::ProgramError)
                }
                _ => None,
            }
        };

        // 6. Hand the sandbox back
        self.release(&slot, &key, &handle, generation).await;

        let finished_at = Utc::now();
        let result = ExecutionResult {
            run_id,
            conversation_key: key,
            sandbox_id: handle.sandbox_id.clone(),
            output,
            success: failure.is_none(),
            exit_code: exit.map(|e| e.status_code()),
            timed_out,
            failure,
            truncated_chars: captured.truncated_chars,
            short_circuit: journal.take(),
            started_at,
            finished_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        // 7. Audit and metrics
        self.audit
            .record(&AuditRecord {
                run_id: result.run_id.clone(),
                conversation_key: result.conversation_key.clone(),
                sandbox_id: Some(result.sandbox_id.clone()),
                program: request.program,
                output: result.output.clone(),
                success: result.success,
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                started_at: result.started_at,
                finished_at: result.finished_at,
            })
            .await;

        let outcome = result.failure.map(|f| f.as_str()).unwrap_or("success");
        RUNS_TOTAL.with_label_values(&[outcome]).inc();
        RUN_DURATION
            .with_label_values(&[self.backend.name()])
            .observe(clock.elapsed().as_secs_f64());
        info!(
            outcome,
            exit_code = ?result.exit_code,
            truncated = result.truncated_chars,
            duration_ms = result.duration_ms,
            short_circuit = result.short_circuit.as_ref().map(|s| s.capability.as_str()),
            "run finished"
        );

        Ok(result)
    }

    /// Reuse the key's idle sandbox or replace it with a fresh one
    ///
    /// Holding the key's lock across teardown and creation is what keeps at
    /// most one live sandbox per key.
    async fn claim(
        self: &Arc<Self>,
        slot: &Slot,
        key: &ConversationKey,
    ) -> Result<(Arc<SandboxHandle>, u64), GovernorError> {
        let mut state = slot.lock().await;
        state.cancel_cleanup();

        if let Some(current) = state.sandbox.clone() {
            if !state.busy && current.is_reusable() && current.age() < self.config.max_sandbox_age {
                state.busy = true;
                state.last_active = Instant::now();
                debug!(sandbox_id = %current.sandbox_id, "reusing live sandbox");
                return Ok((current, state.generation));
            }

            let reason = if state.busy { "replaced" } else { "stale" };
            info!(sandbox_id = %current.sandbox_id, reason, "invalidating sandbox before new run");
            state.sandbox = None;
            state.busy = false;
            state.generation += 1;
            self.teardown(&current, reason).await;
        }

        let spec = SandboxSpec {
            sandbox_id: format!("sbx-{}", Uuid::now_v7()),
            conversation_key: key.clone(),
            limits: self.config.limits.clone(),
        };
        let handle = self
            .backend
            .create(&spec)
            .await
            .map(Arc::new)
            .map_err(|e| GovernorError::SandboxCreation(e.to_string()))?;

        SANDBOXES_CREATED.inc();
        LIVE_SANDBOXES.inc();
        self.live.insert(handle.clone());
        state.generation += 1;
        state.sandbox = Some(handle.clone());
        state.busy = true;
        state.last_active = Instant::now();
        debug!(sandbox_id = %handle.sandbox_id, backend = self.backend.name(), "sandbox created");
        Ok((handle, state.generation))
    }

    async fn release(self: &Arc<Self>, slot: &Slot, key: &ConversationKey, handle: &Arc<SandboxHandle>, generation: u64) {
        let mut state = slot.lock().await;
        if state.generation != generation {
            // Replaced while running; the replacing run tore this sandbox down
            return;
        }
        state.busy = false;
        state.last_active = Instant::now();

        let teardown_reason = match handle.status() {
            SandboxStatus::Killed => Some("killed"),
            SandboxStatus::Failed(_) | SandboxStatus::Destroyed => Some("failed"),
            _ if handle.age() >= self.config.max_sandbox_age => Some("aged"),
            _ => None,
        };

        if let Some(reason) = teardown_reason {
            state.sandbox = None;
            state.generation += 1;
            self.teardown(handle, reason).await;
            drop(state);
            self.arena.release_if_unused(key, slot);
            return;
        }

        handle.mark_ready();
        let inner = self.clone();
        let task_key = key.clone();
        let task_slot = slot.clone();
        let idle = self.config.idle_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            inner.expire(&task_key, &task_slot, idle, "idle").await;
        });
        state.set_cleanup(task.abort_handle());
    }

    /// Deferred cleanup: tear down if still idle
    async fn expire(&self, key: &ConversationKey, slot: &Slot, min_idle: Duration, reason: &'static str) {
        let mut state = slot.lock().await;
        state.clear_cleanup();
        if state.busy || state.idle_for() < min_idle {
            return;
        }
        if let Some(handle) = state.sandbox.take() {
            state.generation += 1;
            self.teardown(&handle, reason).await;
        }
        drop(state);
        self.arena.release_if_unused(key, slot);
    }

    async fn sweep(&self) -> usize {
        let mut swept = 0;
        for (key, slot) in self.arena.entries() {
            let Ok(mut state) = slot.try_lock() else { continue };
            if state.busy {
                continue;
            }
            let expired = state
                .sandbox
                .as_ref()
                .map(|h| state.idle_for() >= self.config.max_idle || h.age() >= self.config.max_sandbox_age)
                .unwrap_or(false);
            if expired {
                state.cancel_cleanup();
                if let Some(handle) = state.sandbox.take() {
                    state.generation += 1;
                    self.teardown(&handle, "sweep").await;
                    swept += 1;
                }
            }
            drop(state);
            self.arena.release_if_unused(&key, &slot);
        }
        swept
    }

    /// Revoke, kill and destroy. Failures degrade to warnings.
    async fn teardown(&self, handle: &SandboxHandle, reason: &'static str) {
        if self.live.remove(&handle.sandbox_id) {
            LIVE_SANDBOXES.dec();
        }
        if let Err(e) = self.backend.kill(handle).await {
            warn!(sandbox_id = %handle.sandbox_id, error = %e, "failed to kill sandbox");
        }
        if let Err(e) = self.backend.destroy(handle).await {
            warn!(sandbox_id = %handle.sandbox_id, error = %e, "failed to destroy sandbox");
        }
        SANDBOXES_DESTROYED.with_label_values(&[reason]).inc();
        debug!(sandbox_id = %handle.sandbox_id, reason, "sandbox torn down");
    }
}
