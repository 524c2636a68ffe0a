//! codevisor - sandboxed program execution for AI agents
//!
//! ## Commands
//!
//! - `serve`: bridge + governor + sweeper, one task per stdin line
//! - `exec`: run a single program file through the governor
//! - `capabilities`: list registered capabilities

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use codevisor::agent::{AgentController, TurnOutcome};
use codevisor::capability::{register_builtins, CapabilityRegistry};
use codevisor::config::{BackendKind, Config};
use codevisor::conversation::ConversationKey;
use codevisor::governor::{ExecutionRequest, Governor};
use codevisor::ollama::{ChatClient, ChatDrafter};
use codevisor::rpc::Bridge;
use codevisor::sandbox::docker::DockerBackend;
use codevisor::sandbox::process::ProcessBackend;
use codevisor::sandbox::IsolationBackend;
use codevisor::telemetry;

#[derive(Parser)]
#[command(name = "codevisor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed program execution for AI agents", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "CODEVISOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge and governor, reading one task per stdin line
    Serve {
        /// Conversation key used for stdin tasks
        #[arg(short, long, default_value = "console")]
        key: String,
    },

    /// Run one program through the governor and print the result
    Exec {
        /// Program file
        file: PathBuf,

        /// Conversation key the run belongs to
        #[arg(short, long, default_value = "cli")]
        key: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List registered capabilities
    Capabilities,
}

/// Everything `serve` and `exec` share
struct Runtime {
    registry: Arc<CapabilityRegistry>,
    governor: Governor,
    shutdown_tx: watch::Sender<bool>,
    bridge_tasks: Vec<JoinHandle<std::io::Result<()>>>,
}

impl Runtime {
    async fn start(config: &Config) -> Result<Self> {
        let registry = Arc::new(CapabilityRegistry::new());
        let names = register_builtins(&registry).context("failed to register builtin capabilities")?;
        info!(capabilities = ?names, "registered builtin capabilities");

        let backend = build_backend(config).await?;

        let listener = TcpListener::bind(config.bridge.listen_addr)
            .await
            .with_context(|| format!("failed to bind bridge on {}", config.bridge.listen_addr))?;
        let addr = listener.local_addr()?;
        let bridge_url = backend.bridge_url(addr);
        info!(%addr, %bridge_url, backend = backend.name(), "bridge listening");

        let socket = backend.bridge_socket();

        let governor = Governor::new(config.governor_config(), backend, registry.clone(), bridge_url);
        let bridge = Bridge::new(registry.clone(), governor.live(), config.bridge_config());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut bridge_tasks = Vec::with_capacity(2);
        if let Some(path) = socket {
            let unix = Bridge::bind_unix(&path)
                .with_context(|| format!("failed to bind bridge socket {}", path.display()))?;
            bridge_tasks.push(tokio::spawn(bridge.clone().serve_unix(unix, stopped(shutdown_rx.clone()))));
        }
        bridge_tasks.push(tokio::spawn(bridge.serve(listener, stopped(shutdown_rx))));

        Ok(Self { registry, governor, shutdown_tx, bridge_tasks })
    }

    async fn stop(self) {
        self.governor.shutdown().await;
        self.shutdown_tx.send_replace(true);
        for task in self.bridge_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "bridge exited with error"),
                Err(e) => warn!(error = %e, "bridge task failed"),
            }
        }
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn build_backend(config: &Config) -> Result<Arc<dyn IsolationBackend>> {
    match config.sandbox.backend {
        BackendKind::Process => {
            let backend = ProcessBackend::new(config.process_backend_config())
                .context("process backend unavailable")?;
            Ok(Arc::new(backend))
        }
        BackendKind::Docker => {
            let backend = DockerBackend::new(config.sandbox.docker.clone(), config.sandbox.data_dir.clone());
            backend.init().await.context("docker backend unavailable")?;
            Ok(Arc::new(backend))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("failed to load {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn serve(config: &Config, key: String) -> Result<()> {
    let runtime = Runtime::start(config).await?;
    runtime.governor.start_sweeper();

    let mut drafter = ChatDrafter::new(ChatClient::new(config.agent.ollama_url.clone()), config.agent.model.clone());
    if let Some(prompt) = &config.agent.system_prompt {
        drafter = drafter.with_system_prompt(prompt.clone());
    }
    let controller = AgentController::new(
        Arc::new(drafter),
        runtime.governor.clone(),
        runtime.registry.clone(),
        config.agent_config(),
    );

    let key = ConversationKey::new(key);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            }
        };
        let Some(task) = line else { break };
        let task = task.trim();
        if task.is_empty() {
            continue;
        }

        let report = controller.run_conversation(&key, task).await;
        for outcome in &report.turns {
            match outcome {
                TurnOutcome::Completed { output, .. } => println!("{}", output),
                other => println!("{}", other.message()),
            }
        }
        if report.chain_exhausted {
            println!("[stopped after {} chained turns]", report.turns.len());
        }
    }

    runtime.stop().await;
    Ok(())
}

async fn exec(config: &Config, file: &Path, key: String, json: bool) -> Result<bool> {
    let program = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let runtime = Runtime::start(config).await?;
    let result = runtime
        .governor
        .execute(ExecutionRequest::new(ConversationKey::new(key), program))
        .await;
    runtime.stop().await;

    let result = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.output);
        if let Some(sc) = &result.short_circuit {
            println!("[{} {} -> {}]", sc.kind, sc.capability, sc.value);
        }
    }
    Ok(result.success)
}

fn list_capabilities() -> Result<()> {
    let registry = CapabilityRegistry::new();
    register_builtins(&registry)?;
    for descriptor in registry.snapshot() {
        println!(
            "{:<16} {:<9} {}",
            descriptor.name,
            descriptor.kind,
            descriptor.usage.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    telemetry::init_tracing(
        "codevisor",
        config.telemetry.otlp_endpoint.as_deref(),
        config.telemetry.json_logs,
    )
    .map_err(|e| anyhow::anyhow!(e))?;

    let outcome = match cli.command {
        Commands::Serve { key } => serve(&config, key).await.map(|_| true),
        Commands::Exec { file, key, json } => exec(&config, &file, key, json).await,
        Commands::Capabilities => list_capabilities().map(|_| true),
    };

    telemetry::shutdown_tracing();
    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}
