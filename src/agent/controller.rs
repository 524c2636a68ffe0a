//! Agent Controller - the self-correction loop
//!
//! One turn drafts a program, runs it through the governor and reacts:
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │ depth < max_retries
//!        Drafting ──► Submitted ──► Failed ─────────────┘
//!                         │           │
//!                         │           └─ depth == max_retries ──► GaveUp
//!                         ▼
//!                     Succeeded ──► Completed | HandOff | ContextRecorded
//! ```
//!
//! Retry depth belongs to the turn. A hand-off starts a fresh turn with a
//! fresh depth, so failures never accumulate across turns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::drafter::{CapabilityListing, ConversationEntry, Draft, DraftRequest, Drafter, FailedAttempt};
use crate::capability::{CapabilityRegistry, MethodKind};
use crate::conversation::ConversationKey;
use crate::governor::{ExecutionRequest, ExecutionResult, FailureClass, Governor};
use crate::metrics::{DRAFT_DURATION, TURNS_TOTAL, TURN_ATTEMPTS};

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Retries after the first failed attempt of a turn
    pub max_retries: usize,
    /// Turns one conversation may chain through hand-offs
    pub max_chained_turns: usize,
    /// Per-run deadline, governor default when `None`
    pub run_timeout: Option<Duration>,
    /// Per-run output limit, governor default when `None`
    pub output_limit: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_chained_turns: 5,
            run_timeout: None,
            output_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Drafting,
    Submitted,
    Succeeded,
    Failed,
}

/// Progress of one turn
#[derive(Debug)]
struct Turn {
    state: TurnState,
    /// Failed attempts so far
    depth: usize,
    attempts: usize,
    previous: Option<FailedAttempt>,
}

impl Turn {
    fn new() -> Self {
        Self {
            state: TurnState::Drafting,
            depth: 0,
            attempts: 0,
            previous: None,
        }
    }

    fn advance(&mut self, next: TurnState) {
        let allowed = matches!(
            (self.state, next),
            (TurnState::Drafting, TurnState::Submitted)
                | (TurnState::Drafting, TurnState::Succeeded)
                | (TurnState::Drafting, TurnState::Failed)
                | (TurnState::Submitted, TurnState::Succeeded)
                | (TurnState::Submitted, TurnState::Failed)
                | (TurnState::Failed, TurnState::Drafting)
        );
        debug_assert!(allowed, "invalid turn transition {:?} -> {:?}", self.state, next);
        debug!(from = ?self.state, to = ?next, depth = self.depth, "turn state");
        self.state = next;
    }

    /// Record a failure; returns whether another attempt is allowed
    fn fail(&mut self, program: String, error: String, max_retries: usize) -> bool {
        self.advance(TurnState::Failed);
        self.previous = Some(FailedAttempt { program, error });
        if self.depth >= max_retries {
            return false;
        }
        self.depth += 1;
        self.advance(TurnState::Drafting);
        true
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The program ran to completion, or the drafter answered directly
    Completed { output: String, attempts: usize },
    /// An agent capability ended the program; a new turn must follow
    HandOff { capability: String, value: Value, attempts: usize },
    /// A behavior capability ended the program; its value becomes context
    ContextRecorded { capability: String, value: Value, attempts: usize },
    /// Every attempt failed
    GaveUp { attempts: usize, last_error: String },
    /// Not retried: no slot, no sandbox, or no draft
    Aborted { reason: String },
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TurnOutcome::Completed { .. } => "completed",
            TurnOutcome::HandOff { .. } => "hand_off",
            TurnOutcome::ContextRecorded { .. } => "context_recorded",
            TurnOutcome::GaveUp { .. } => "gave_up",
            TurnOutcome::Aborted { .. } => "aborted",
        }
    }

    /// Text surfaced to the conversation
    pub fn message(&self) -> String {
        match self {
            TurnOutcome::Completed { output, .. } => output.clone(),
            TurnOutcome::HandOff { value, .. } | TurnOutcome::ContextRecorded { value, .. } => value_text(value),
            TurnOutcome::GaveUp { attempts, last_error } => format!(
                "could not complete after {} attempts. Last error:\n{}",
                attempts, last_error
            ),
            TurnOutcome::Aborted { reason } => format!("could not run the program: {}", reason),
        }
    }
}

/// Everything a conversation produced
#[derive(Debug, Clone, Serialize)]
pub struct ConversationReport {
    pub conversation_key: ConversationKey,
    pub turns: Vec<TurnOutcome>,
    pub history: Vec<ConversationEntry>,
    /// Stopped because `max_chained_turns` was reached
    pub chain_exhausted: bool,
}

impl ConversationReport {
    pub fn last(&self) -> Option<&TurnOutcome> {
        self.turns.last()
    }
}

/// Error text fed back to the drafter, prefixed by failure class
pub fn failure_feedback(result: &ExecutionResult) -> String {
    let hint = match result.failure {
        Some(FailureClass::Timeout) => {
            "The program timed out. Make it faster or do less work in one run."
        }
        Some(FailureClass::Replaced) => "The program was interrupted by a newer run. Run it again.",
        Some(FailureClass::SandboxError) => "The sandbox failed to run the program.",
        Some(FailureClass::ProgramError) | None => "The program failed. Read the error and fix the program.",
    };
    format!("{}\n{}", hint, result.output)
}

/// Render a capability value as conversation text
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Agent Controller driving drafts through the governor
pub struct AgentController {
    drafter: Arc<dyn Drafter>,
    governor: Governor,
    registry: Arc<CapabilityRegistry>,
    config: AgentConfig,
}

impl AgentController {
    pub fn new(
        drafter: Arc<dyn Drafter>,
        governor: Governor,
        registry: Arc<CapabilityRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            drafter,
            governor,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// One independent turn with empty history
    pub async fn run_turn(&self, key: &ConversationKey, task: &str) -> TurnOutcome {
        let history = vec![ConversationEntry::user(task)];
        self.turn(key, task, &history).await
    }

    /// Chain turns until one completes, gives up, or records context
    pub async fn run_conversation(&self, key: &ConversationKey, task: &str) -> ConversationReport {
        let mut history = vec![ConversationEntry::user(task)];
        let mut turns = Vec::new();
        let mut current_task = task.to_string();
        let mut chain_exhausted = true;

        for _ in 0..self.config.max_chained_turns.max(1) {
            let outcome = self.turn(key, &current_task, &history).await;
            let message = outcome.message();
            let next = match &outcome {
                TurnOutcome::HandOff { .. } => {
                    history.push(ConversationEntry::assistant(message.clone()));
                    Some(format!(
                        "Your previous program sent this message:\n{}\nContinue with the original task: {}",
                        message, task
                    ))
                }
                TurnOutcome::ContextRecorded { capability, .. } => {
                    history.push(ConversationEntry::context(format!("{}: {}", capability, message)));
                    None
                }
                _ => {
                    history.push(ConversationEntry::assistant(message));
                    None
                }
            };
            turns.push(outcome);

            match next {
                Some(task) => current_task = task,
                None => {
                    chain_exhausted = false;
                    break;
                }
            }
        }

        if chain_exhausted {
            warn!(conversation_key = %key, turns = turns.len(), "hand-off chain limit reached");
        }
        ConversationReport {
            conversation_key: key.clone(),
            turns,
            history,
            chain_exhausted,
        }
    }

    async fn turn(&self, key: &ConversationKey, task: &str, history: &[ConversationEntry]) -> TurnOutcome {
        let turn_id = format!("turn-{}", Uuid::now_v7());
        let span = info_span!("turn", turn_id = %turn_id, conversation_key = %key);

        async {
            let outcome = self.drive(key, task, history).await;
            TURNS_TOTAL.with_label_values(&[outcome.label()]).inc();
            match &outcome {
                TurnOutcome::Completed { attempts, .. }
                | TurnOutcome::HandOff { attempts, .. }
                | TurnOutcome::ContextRecorded { attempts, .. }
                | TurnOutcome::GaveUp { attempts, .. } => {
                    TURN_ATTEMPTS.observe(*attempts as f64);
                }
                TurnOutcome::Aborted { .. } => {}
            }
            info!(outcome = outcome.label(), "turn finished");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, key: &ConversationKey, task: &str, history: &[ConversationEntry]) -> TurnOutcome {
        let capabilities: Vec<CapabilityListing> = self
            .registry
            .snapshot()
            .iter()
            .map(|d| CapabilityListing::from(d.as_ref()))
            .collect();
        let mut turn = Turn::new();

        loop {
            let request = DraftRequest {
                task: task.to_string(),
                capabilities: capabilities.clone(),
                history: history.to_vec(),
                attempt: turn.depth,
                previous: turn.previous.clone(),
            };

            let draft_start = Instant::now();
            let draft = self.drafter.draft(&request).await;
            DRAFT_DURATION
                .with_label_values(&[self.drafter.model()])
                .observe(draft_start.elapsed().as_secs_f64());

            let program = match draft {
                Ok(Draft::Program(program)) => program,
                Ok(Draft::Answer(text)) => {
                    turn.advance(TurnState::Succeeded);
                    return TurnOutcome::Completed {
                        output: text,
                        attempts: turn.attempts,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "drafter failed");
                    return TurnOutcome::Aborted { reason: e.to_string() };
                }
            };

            if program.trim().is_empty() {
                warn!(attempt = turn.depth, "rejecting empty program");
                turn.attempts += 1;
                let error = "The program was empty. Provide a complete program.".to_string();
                if !turn.fail(program, error.clone(), self.config.max_retries) {
                    return TurnOutcome::GaveUp {
                        attempts: turn.attempts,
                        last_error: error,
                    };
                }
                continue;
            }

            turn.advance(TurnState::Submitted);
            turn.attempts += 1;
            let mut request = ExecutionRequest::new(key.clone(), program.clone());
            request.timeout = self.config.run_timeout;
            request.output_limit = self.config.output_limit;

            let result = match self.governor.execute(request).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "run not admitted");
                    return TurnOutcome::Aborted { reason: e.to_string() };
                }
            };

            if result.success {
                turn.advance(TurnState::Succeeded);
                return match result.short_circuit {
                    Some(sc) if sc.kind == MethodKind::Agent => TurnOutcome::HandOff {
                        capability: sc.capability,
                        value: sc.value,
                        attempts: turn.attempts,
                    },
                    Some(sc) if sc.kind == MethodKind::Behavior => TurnOutcome::ContextRecorded {
                        capability: sc.capability,
                        value: sc.value,
                        attempts: turn.attempts,
                    },
                    _ => TurnOutcome::Completed {
                        output: result.output,
                        attempts: turn.attempts,
                    },
                };
            }

            let error = failure_feedback(&result);
            info!(
                attempt = turn.attempts,
                failure = result.failure.map(|f| f.as_str()),
                "attempt failed"
            );
            if !turn.fail(program, error.clone(), self.config.max_retries) {
                return TurnOutcome::GaveUp {
                    attempts: turn.attempts,
                    last_error: error,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_allows_max_retries_plus_one_attempts() {
        let mut turn = Turn::new();
        let mut attempts = 0;
        loop {
            turn.advance(TurnState::Submitted);
            attempts += 1;
            if !turn.fail("p".into(), "e".into(), 2) {
                break;
            }
        }
        assert_eq!(attempts, 3);
        assert_eq!(turn.state, TurnState::Failed);
        assert_eq!(turn.previous.as_ref().unwrap().error, "e");
    }

    #[test]
    fn test_zero_retries_means_one_attempt() {
        let mut turn = Turn::new();
        turn.advance(TurnState::Submitted);
        assert!(!turn.fail("p".into(), "e".into(), 0));
    }

    #[test]
    fn test_gave_up_message() {
        let outcome = TurnOutcome::GaveUp {
            attempts: 4,
            last_error: "boom".into(),
        };
        assert!(outcome.message().starts_with("could not complete after 4 attempts"));
        assert_eq!(outcome.label(), "gave_up");
    }

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(&json!({"message": "hi"})), "hi");
        assert_eq!(value_text(&json!("plain")), "plain");
        assert_eq!(value_text(&json!(3)), "3");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TurnOutcome::HandOff {
            capability: "send_message".into(),
            value: json!({"message": "hi"}),
            attempts: 1,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "hand_off");
    }
}
