//! The generated Python stubs, run by a real interpreter
//!
//! Programs go through the process backend and call back into a live
//! bridge. Every test returns early when python3 is not installed.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use codevisor::capability::{register_builtins, CapabilityRegistry};
use codevisor::conversation::ConversationKey;
use codevisor::governor::{ExecutionRequest, Governor, GovernorConfig};
use codevisor::rpc::{Bridge, BridgeConfig};
use codevisor::sandbox::process::{ProcessBackend, ProcessBackendConfig};
use codevisor::sandbox::IsolationBackend;
use codevisor::stub::{parse_sentinels, SENTINEL_OPEN};

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

macro_rules! require_python3 {
    () => {
        if !python3_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
    };
}

enum Transport {
    Tcp,
    Unix,
}

struct PythonHost {
    governor: Governor,
    shutdown: Option<oneshot::Sender<()>>,
    _data: TempDir,
}

impl PythonHost {
    async fn start(transport: Transport) -> Self {
        let data = tempfile::tempdir().unwrap();
        let registry = Arc::new(CapabilityRegistry::new());
        register_builtins(&registry).unwrap();

        let backend = Arc::new(
            ProcessBackend::new(ProcessBackendConfig {
                data_dir: data.path().to_path_buf(),
                cgroups: false,
                insecure: true,
                ..ProcessBackendConfig::default()
            })
            .unwrap(),
        );

        let (tx, rx) = oneshot::channel::<()>();
        let stop = async {
            let _ = rx.await;
        };

        let config = GovernorConfig {
            data_dir: data.path().to_path_buf(),
            ..GovernorConfig::default()
        };
        let governor = match transport {
            Transport::Tcp => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let url = backend.bridge_url(listener.local_addr().unwrap());
                let governor = Governor::new(config, backend, registry.clone(), url);
                let bridge = Bridge::new(registry, governor.live(), BridgeConfig::default());
                tokio::spawn(bridge.serve(listener, stop));
                governor
            }
            Transport::Unix => {
                let path = data.path().join("bridge.sock");
                let listener = Bridge::bind_unix(&path).unwrap();
                let url = format!("unix://{}", path.display());
                let governor = Governor::new(config, backend, registry.clone(), url);
                let bridge = Bridge::new(registry, governor.live(), BridgeConfig::default());
                tokio::spawn(bridge.serve_unix(listener, stop));
                governor
            }
        };

        Self {
            governor,
            shutdown: Some(tx),
            _data: data,
        }
    }

    async fn run(&self, key: &str, program: &str) -> codevisor::ExecutionResult {
        self.governor
            .execute(ExecutionRequest::new(ConversationKey::new(key), program))
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        self.governor.shutdown().await;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[tokio::test]
async fn test_tool_result_flows_back_into_program() {
    require_python3!();
    let host = PythonHost::start(Transport::Tcp).await;

    let result = host.run("py-1", "x = tool_echo('hi')\nprint(x)").await;

    assert!(result.success, "{}", result.output);
    assert_eq!(result.output, "hi\n");
    assert!(result.short_circuit.is_none());

    host.stop().await;
}

#[tokio::test]
async fn test_agent_call_prints_sentinel_and_exits() {
    require_python3!();
    let host = PythonHost::start(Transport::Unix).await;

    let result = host.run("py-1", "send_message('bye')\nprint('AFTER')").await;

    assert!(result.success, "{}", result.output);
    assert!(result.output.starts_with(SENTINEL_OPEN), "{}", result.output);
    assert!(!result.output.contains("AFTER"));
    let blocks = parse_sentinels(&result.output);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].name, "send_message");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&blocks[0].body).unwrap(),
        serde_json::json!({ "message": "bye" })
    );
    assert_eq!(result.short_circuit.unwrap().capability, "send_message");

    host.stop().await;
}

#[tokio::test]
async fn test_non_ascii_key_from_python() {
    require_python3!();
    let host = PythonHost::start(Transport::Tcp).await;

    for key in ["café", "会话-1"] {
        let result = host.run(key, "print(tool_echo('ok'))").await;
        assert!(result.success, "key {}: {}", key, result.output);
        assert_eq!(result.output, "ok\n");
    }

    host.stop().await;
}

#[tokio::test]
async fn test_capability_failure_raises_in_program() {
    require_python3!();
    let host = PythonHost::start(Transport::Unix).await;

    let program = "\
try:
    roll_dice('bad')
except CapabilityCallError as exc:
    print('caught', exc)
";
    let result = host.run("py-1", program).await;

    assert!(result.success, "{}", result.output);
    assert!(result.output.starts_with("caught roll_dice: "), "{}", result.output);

    host.stop().await;
}

#[tokio::test]
async fn test_traceback_points_at_body_lines() {
    require_python3!();
    let host = PythonHost::start(Transport::Tcp).await;

    let result = host.run("py-1", "x = 1\nraise ValueError(x)").await;

    assert!(!result.success);
    assert!(result.output.contains("line 2, in <module>"), "{}", result.output);
    assert!(result.output.contains("[process exited with code 1]"));

    host.stop().await;
}
