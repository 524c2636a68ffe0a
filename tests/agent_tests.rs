//! Integration tests for the self-correction loop
//!
//! These tests drive the agent controller through the real governor and
//! bridge with a scripted drafter and the scripted backend from `common`.
//! The test that needs Ollama and python3 is marked #[ignore].

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use codevisor::agent::{AgentConfig, AgentController, Draft, Role, TurnOutcome};
use codevisor::conversation::ConversationKey;
use codevisor::ollama::tool_use::{ChatClient, ChatMessage};

use common::{Harness, ScriptedDrafter};

fn controller(h: &Harness, drafter: Arc<ScriptedDrafter>, config: AgentConfig) -> AgentController {
    AgentController::new(drafter, h.governor.clone(), h.registry.clone(), config)
}

/// Test that AgentConfig has sensible defaults
#[test]
fn test_agent_config_defaults() {
    let config = AgentConfig::default();

    assert_eq!(config.max_retries, 3);
    assert_eq!(config.max_chained_turns, 5);
    assert!(config.run_timeout.is_none());
    assert!(config.output_limit.is_none());
}

/// Test ChatMessage construction with helper methods
#[test]
fn test_chat_message_construction() {
    let user_msg = ChatMessage::user("Hello, world!");
    assert_eq!(user_msg.role, "user");
    assert_eq!(user_msg.content, "Hello, world!");
    assert!(user_msg.tool_calls.is_none());

    assert_eq!(ChatMessage::system("You are helpful.").role, "system");
    assert_eq!(ChatMessage::assistant("I can help!").role, "assistant");
    assert_eq!(ChatMessage::tool("Result: 42").role, "tool");
}

/// Test the run_program tool serializes as an Ollama function tool
#[test]
fn test_run_program_tool_serialization() {
    let json = serde_json::to_value(ChatClient::run_program_tool()).unwrap();

    assert_eq!(json["type"], "function");
    assert_eq!(json["function"]["name"], "run_program");
    assert!(json["function"]["parameters"]["properties"]["code"].is_object());
}

/// Test that a failed attempt is fed back and the retry succeeds
#[tokio::test]
async fn test_retry_after_program_error() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&["print oops\nexit 3", "print fixed"]));
    let agent = controller(&h, drafter.clone(), AgentConfig::default());

    let outcome = agent.run_turn(&ConversationKey::new("chat-1"), "do the thing").await;

    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            output: "fixed\n".into(),
            attempts: 2
        }
    );

    let requests = drafter.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].attempt, 0);
    assert!(requests[0].previous.is_none());
    assert!(requests[0].capabilities.iter().any(|c| c.name == "send_message"));

    let previous = requests[1].previous.as_ref().unwrap();
    assert_eq!(requests[1].attempt, 1);
    assert_eq!(previous.program, "print oops\nexit 3");
    assert!(previous.error.starts_with("The program failed."));
    assert!(previous.error.contains("[process exited with code 3]"));

    h.stop().await;
}

/// Test that a turn makes exactly max_retries + 1 attempts before giving up
#[tokio::test]
async fn test_gives_up_after_retry_budget() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&["exit 1", "exit 1", "exit 1", "print never"]));
    let agent = controller(
        &h,
        drafter.clone(),
        AgentConfig {
            max_retries: 2,
            ..AgentConfig::default()
        },
    );

    let outcome = agent.run_turn(&ConversationKey::new("chat-1"), "impossible").await;

    match &outcome {
        TurnOutcome::GaveUp { attempts, last_error } => {
            assert_eq!(*attempts, 3);
            assert!(last_error.contains("[process exited with code 1]"));
        }
        other => panic!("expected GaveUp, got {:?}", other),
    }
    assert!(outcome.message().starts_with("could not complete after 3 attempts"));
    assert_eq!(drafter.requests().len(), 3);

    h.stop().await;
}

/// Test that a timeout is reported to the drafter with its own hint
#[tokio::test]
async fn test_timeout_feedback() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&["sleep 5000", "print quick"]));
    let agent = controller(
        &h,
        drafter.clone(),
        AgentConfig {
            run_timeout: Some(Duration::from_millis(100)),
            ..AgentConfig::default()
        },
    );

    let outcome = agent.run_turn(&ConversationKey::new("chat-1"), "be quick").await;
    assert!(matches!(outcome, TurnOutcome::Completed { attempts: 2, .. }));

    let requests = drafter.requests();
    let error = &requests[1].previous.as_ref().unwrap().error;
    assert!(error.starts_with("The program timed out."));
    assert!(error.contains("[terminated due to timeout after 0.1s]"));

    h.stop().await;
}

/// Test that an empty program counts as a failed attempt
#[tokio::test]
async fn test_empty_program_is_an_attempt() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&["   ", "print ok"]));
    let agent = controller(&h, drafter.clone(), AgentConfig::default());

    let outcome = agent.run_turn(&ConversationKey::new("chat-1"), "anything").await;

    assert!(matches!(outcome, TurnOutcome::Completed { attempts: 2, .. }));
    assert!(drafter.requests()[1].previous.as_ref().unwrap().error.contains("empty"));
    // Nothing was submitted for the empty draft
    assert_eq!(h.governor.audit().read_all().await.unwrap().len(), 1);

    h.stop().await;
}

/// Test that a hand-off starts a new turn with a fresh retry budget
#[tokio::test]
async fn test_hand_off_chains_with_fresh_depth() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&[
        // first turn: one failure, then hand off
        "exit 1",
        "call send_message [\"halfway there\"]",
        // second turn: one failure again, then finish
        "exit 1",
        "print all done",
    ]));
    let agent = controller(
        &h,
        drafter.clone(),
        AgentConfig {
            max_retries: 1,
            ..AgentConfig::default()
        },
    );

    let report = agent
        .run_conversation(&ConversationKey::new("chat-1"), "two step task")
        .await;

    assert_eq!(report.turns.len(), 2);
    assert_eq!(
        report.turns[0],
        TurnOutcome::HandOff {
            capability: "send_message".into(),
            value: json!({ "message": "halfway there" }),
            attempts: 2
        }
    );
    assert!(matches!(&report.turns[1], TurnOutcome::Completed { output, attempts: 2 } if output == "all done\n"));
    assert!(!report.chain_exhausted);

    let requests = drafter.requests();
    assert_eq!(requests[2].attempt, 0);
    assert!(requests[2].previous.is_none());
    assert!(requests[2].task.contains("halfway there"));
    assert!(requests[2].task.contains("two step task"));
    assert_eq!(requests[2].history.last().unwrap().role, Role::Assistant);

    h.stop().await;
}

/// Test that a behavior result is kept as context and ends the conversation
#[tokio::test]
async fn test_behavior_records_context() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&["call set_timer [5, \"tea\"]"]));
    let agent = controller(&h, drafter, AgentConfig::default());

    let report = agent
        .run_conversation(&ConversationKey::new("chat-1"), "remind me about tea")
        .await;

    assert_eq!(report.turns.len(), 1);
    match &report.turns[0] {
        TurnOutcome::ContextRecorded { capability, value, attempts } => {
            assert_eq!(capability, "set_timer");
            assert_eq!(value["timer"]["note"], "tea");
            assert_eq!(*attempts, 1);
        }
        other => panic!("expected ContextRecorded, got {:?}", other),
    }
    let last = report.history.last().unwrap();
    assert_eq!(last.role, Role::Context);
    assert!(last.content.starts_with("set_timer: "));

    h.stop().await;
}

/// Test that a chain of hand-offs stops at max_chained_turns
#[tokio::test]
async fn test_chain_limit() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::programs(&[
        "call send_message [\"one\"]",
        "call send_message [\"two\"]",
        "call send_message [\"three\"]",
    ]));
    let agent = controller(
        &h,
        drafter,
        AgentConfig {
            max_chained_turns: 2,
            ..AgentConfig::default()
        },
    );

    let report = agent.run_conversation(&ConversationKey::new("chat-1"), "loop").await;

    assert_eq!(report.turns.len(), 2);
    assert!(report.chain_exhausted);

    h.stop().await;
}

/// Test that a plain answer completes the turn without running anything
#[tokio::test]
async fn test_direct_answer() {
    let h = Harness::start().await;
    let drafter = Arc::new(ScriptedDrafter::new(vec![Draft::Answer("4".into())]));
    let agent = controller(&h, drafter, AgentConfig::default());

    let outcome = agent.run_turn(&ConversationKey::new("chat-1"), "2 + 2?").await;

    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            output: "4".into(),
            attempts: 0
        }
    );
    assert_eq!(h.backend.created(), 0);

    h.stop().await;
}

/// Test that admission failures abort the turn instead of retrying
#[tokio::test]
async fn test_sandbox_failure_aborts() {
    let h = Harness::start().await;
    h.backend.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
    let drafter = Arc::new(ScriptedDrafter::programs(&["print a", "print b"]));
    let agent = controller(&h, drafter.clone(), AgentConfig::default());

    let outcome = agent.run_turn(&ConversationKey::new("chat-1"), "anything").await;

    assert!(matches!(outcome, TurnOutcome::Aborted { .. }));
    assert_eq!(drafter.requests().len(), 1);

    h.stop().await;
}

// Integration tests that require external services

/// Test a full turn against a local model and python3
#[tokio::test]
#[ignore = "Requires Ollama with qwen3 and python3 on the host"]
async fn test_agent_simple_task() {
    use codevisor::capability::{register_builtins, CapabilityRegistry};
    use codevisor::governor::{Governor, GovernorConfig};
    use codevisor::ollama::ChatDrafter;
    use codevisor::rpc::{Bridge, BridgeConfig};
    use codevisor::sandbox::process::{ProcessBackend, ProcessBackendConfig};
    use codevisor::sandbox::IsolationBackend;

    let data = tempfile::tempdir().unwrap();
    let registry = Arc::new(CapabilityRegistry::new());
    register_builtins(&registry).unwrap();

    let backend = Arc::new(ProcessBackend::new(ProcessBackendConfig {
        data_dir: data.path().to_path_buf(),
        cgroups: false,
        insecure: true,
        ..ProcessBackendConfig::default()
    })
    .unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_url = backend.bridge_url(listener.local_addr().unwrap());
    let governor = Governor::new(
        GovernorConfig {
            data_dir: data.path().to_path_buf(),
            ..GovernorConfig::default()
        },
        backend,
        registry.clone(),
        bridge_url,
    );
    let bridge = Bridge::new(registry.clone(), governor.live(), BridgeConfig::default());
    tokio::spawn(bridge.serve(listener, std::future::pending()));

    let drafter = ChatDrafter::new(ChatClient::new("http://localhost:11434"), "qwen3");
    let agent = AgentController::new(Arc::new(drafter), governor.clone(), registry, AgentConfig::default());

    let outcome = agent
        .run_turn(&ConversationKey::new("chat-1"), "Print the result of 6 * 7")
        .await;

    assert!(outcome.message().contains("42"), "{:?}", outcome);
    governor.shutdown().await;
}
