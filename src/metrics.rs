//! Prometheus metrics
//!
//! Registered once in the default registry. [`gather_text`] renders them in
//! the text exposition format served at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_gauge, CounterVec, Encoder, Histogram, HistogramVec, IntCounter, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Execution Governor
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished runs by outcome.
    ///
    /// Labels:
    /// - outcome: success | program_error | timeout | replaced | sandbox_error | admission_error
    pub static ref RUNS_TOTAL: CounterVec = register_counter_vec!(
        "codevisor_runs_total",
        "Program runs by outcome",
        &["outcome"]
    ).expect("failed to register RUNS_TOTAL metric");

    /// Wall-clock duration of runs, from slot acquisition to result.
    pub static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "codevisor_run_duration_seconds",
        "Duration of program runs",
        &["backend"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register RUN_DURATION metric");

    /// Time spent waiting for an execution slot.
    pub static ref SLOT_WAIT: Histogram = register_histogram!(
        "codevisor_slot_wait_seconds",
        "Time runs wait for a concurrency slot",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
    ).expect("failed to register SLOT_WAIT metric");

    pub static ref LIVE_SANDBOXES: IntGauge = register_int_gauge!(
        "codevisor_live_sandboxes",
        "Sandboxes currently alive"
    ).expect("failed to register LIVE_SANDBOXES metric");

    pub static ref RUNNING_EXECUTIONS: IntGauge = register_int_gauge!(
        "codevisor_running_executions",
        "Runs currently holding an execution slot"
    ).expect("failed to register RUNNING_EXECUTIONS metric");

    pub static ref SANDBOXES_CREATED: IntCounter = register_int_counter!(
        "codevisor_sandboxes_created_total",
        "Sandboxes created"
    ).expect("failed to register SANDBOXES_CREATED metric");

    /// Sandboxes torn down.
    ///
    /// Labels:
    /// - reason: idle | aged | replaced | stale | killed | failed | sweep | shutdown
    pub static ref SANDBOXES_DESTROYED: CounterVec = register_counter_vec!(
        "codevisor_sandboxes_destroyed_total",
        "Sandboxes destroyed by reason",
        &["reason"]
    ).expect("failed to register SANDBOXES_DESTROYED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // RPC Bridge
    // ─────────────────────────────────────────────────────────────────────────────

    /// Capability calls that reached the registry.
    ///
    /// Labels:
    /// - capability: registered name, or "unknown"
    /// - outcome: ok | error | panic
    pub static ref RPC_CALLS: CounterVec = register_counter_vec!(
        "codevisor_rpc_calls_total",
        "Capability calls by capability and outcome",
        &["capability", "outcome"]
    ).expect("failed to register RPC_CALLS metric");

    /// Calls rejected before reaching the registry.
    ///
    /// Labels:
    /// - reason: unknown_sandbox | key_mismatch | stale_run | rate_limited | malformed
    pub static ref RPC_REJECTED: CounterVec = register_counter_vec!(
        "codevisor_rpc_rejected_total",
        "Capability calls rejected by reason",
        &["reason"]
    ).expect("failed to register RPC_REJECTED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Self-Correction Loop
    // ─────────────────────────────────────────────────────────────────────────────

    /// Turns by outcome.
    ///
    /// Labels:
    /// - outcome: completed | hand_off | context_recorded | gave_up | aborted
    pub static ref TURNS_TOTAL: CounterVec = register_counter_vec!(
        "codevisor_turns_total",
        "Reasoning turns by outcome",
        &["outcome"]
    ).expect("failed to register TURNS_TOTAL metric");

    /// Attempts needed per turn.
    pub static ref TURN_ATTEMPTS: Histogram = register_histogram!(
        "codevisor_turn_attempts",
        "Program attempts per turn",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0]
    ).expect("failed to register TURN_ATTEMPTS metric");

    /// Latency of drafter (LLM) calls.
    pub static ref DRAFT_DURATION: HistogramVec = register_histogram_vec!(
        "codevisor_draft_duration_seconds",
        "Time to draft one program",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register DRAFT_DURATION metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
