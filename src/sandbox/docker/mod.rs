//! Container-backed sandboxes
//!
//! One container per sandbox, kept idle (`sleep infinity`) between runs;
//! each run is an exec inside it. A killed container is removed, never
//! reused.
//!
//! ```text
//! create:  POST /containers/create  ─►  POST /containers/{id}/start
//! run:     POST /containers/{id}/exec ─► POST /exec/{id}/start (stream) ─► GET /exec/{id}/json
//! kill:    POST /containers/{id}/kill      (404/409 = already gone)
//! destroy: DELETE /containers/{id}?force   (404/409 = already gone)
//! ```

pub mod client;
pub mod config;
pub mod frames;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::{debug, info, warn};

use self::client::{DockerClient, Removal};
use self::config::{ContainerCreate, ExecCreate, HostConfig, NetworkCreate};
use self::frames::FrameDecoder;
use super::{
    IsolationBackend, OutputSink, RunExit, SandboxDirs, SandboxError, SandboxHandle, SandboxSpec,
    PROGRAM_DIR, PROGRAM_FILE,
};
use crate::stub::ProgramBundle;

pub use config::DockerConfig;

pub const GUEST_SHARED_DIR: &str = "/mnt/shared";
pub const GUEST_INPUT_DIR: &str = "/mnt/input";

pub struct DockerBackend {
    client: DockerClient,
    config: DockerConfig,
    dirs: SandboxDirs,
}

impl DockerBackend {
    pub fn new(config: DockerConfig, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: DockerClient::new(&config.socket_path),
            dirs: SandboxDirs::new(data_dir),
            config,
        }
    }

    /// Check the daemon is reachable and the sandbox network exists
    ///
    /// The network is a plain bridge with masquerading disabled: containers
    /// reach host addresses (and therefore the RPC bridge) but have no route
    /// to the outside world.
    pub async fn init(&self) -> Result<(), SandboxError> {
        self.client.ping().await?;
        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.enable_ip_masquerade".to_string(),
            "false".to_string(),
        );
        let mut labels = HashMap::new();
        labels.insert("codevisor".to_string(), "true".to_string());
        self.client
            .ensure_network(&NetworkCreate {
                name: self.config.network.clone(),
                driver: "bridge".to_string(),
                options,
                labels,
            })
            .await?;
        info!(network = %self.config.network, image = %self.config.image, "docker backend ready");
        Ok(())
    }

    fn container_spec(&self, spec: &SandboxSpec, shared: &Path, input: &Path) -> ContainerCreate {
        let mut labels = HashMap::new();
        labels.insert("codevisor.sandbox_id".to_string(), spec.sandbox_id.clone());
        labels.insert("codevisor.conversation".to_string(), spec.conversation_key.dir_name());

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}m", self.config.tmpfs_size_mb),
        );

        ContainerCreate {
            image: self.config.image.clone(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            user: self.config.user.clone(),
            working_dir: GUEST_SHARED_DIR.to_string(),
            labels,
            host_config: HostConfig {
                memory: spec.limits.memory_bytes,
                memory_swap: spec.limits.memory_bytes,
                nano_cpus: spec.limits.nano_cpus(),
                pids_limit: spec.limits.pids_max as i64,
                cap_drop: vec!["ALL".to_string()],
                security_opt: vec!["no-new-privileges".to_string()],
                readonly_rootfs: true,
                tmpfs,
                binds: vec![
                    format!("{}:{}:ro", input.display(), GUEST_INPUT_DIR),
                    format!("{}:{}:rw", shared.display(), GUEST_SHARED_DIR),
                ],
                network_mode: self.config.network.clone(),
                extra_hosts: vec![format!("{}:host-gateway", self.config.bridge_host)],
            },
        }
    }

    fn exec_spec(&self, program: &ProgramBundle) -> ExecCreate {
        let program_path = format!("{}/{}/{}", GUEST_SHARED_DIR, PROGRAM_DIR, PROGRAM_FILE);
        let mut cmd = self.config.interpreter.clone();
        cmd.push(program_path);

        let mut env: Vec<String> = vec![
            "PYTHONUNBUFFERED=1".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            format!("HOME={}", GUEST_SHARED_DIR),
            format!("CODEVISOR_SHARED_DIR={}", GUEST_SHARED_DIR),
            format!("CODEVISOR_INPUT_DIR={}", GUEST_INPUT_DIR),
        ];
        env.extend(program.env.iter().map(|(k, v)| format!("{}={}", k, v)));

        ExecCreate {
            cmd,
            env,
            working_dir: GUEST_SHARED_DIR.to_string(),
            attach_stdout: true,
            attach_stderr: true,
            attach_stdin: false,
            tty: false,
        }
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn bridge_url(&self, bridge_addr: SocketAddr) -> String {
        format!("http://{}:{}", self.config.bridge_host, bridge_addr.port())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let (root, shared, input) = self
            .dirs
            .prepare(spec)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;
        // Bind mounts need absolute host paths
        let shared_abs = tokio::fs::canonicalize(&shared).await?;
        let input_abs = tokio::fs::canonicalize(&input).await?;

        let name = format!("codevisor-{}", spec.sandbox_id);
        let payload = self.container_spec(spec, &shared_abs, &input_abs);
        let container_id = self
            .client
            .create_container(&name, &payload)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if let Err(e) = self.client.start_container(&container_id).await {
            if let Err(cleanup) = self.client.remove_container(&container_id).await {
                warn!(container_id = %container_id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(SandboxError::Create(e.to_string()));
        }

        debug!(sandbox_id = %spec.sandbox_id, container_id = %container_id, "container sandbox created");
        Ok(SandboxHandle::new(spec.sandbox_id.clone(), spec.conversation_key.clone(), root, shared, input)
            .with_guest_paths(GUEST_SHARED_DIR, GUEST_INPUT_DIR)
            .with_container(container_id))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        program: &ProgramBundle,
        output: &OutputSink,
    ) -> Result<RunExit, SandboxError> {
        let container_id = handle
            .container_id
            .as_deref()
            .ok_or_else(|| SandboxError::Run("sandbox has no container".into()))?;
        self.dirs.write_program(&handle.shared_dir, program).await?;

        let exec_id = self
            .client
            .create_exec(container_id, &self.exec_spec(program))
            .await
            .map_err(|e| SandboxError::Run(e.to_string()))?;
        let mut body = self
            .client
            .start_exec(&exec_id)
            .await
            .map_err(|e| SandboxError::Run(e.to_string()))?;

        let mut decoder = FrameDecoder::new();
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    // Stream cut, e.g. container killed mid-run
                    debug!(exec_id = %exec_id, error = %e, "exec stream ended");
                    break;
                }
            };
            if let Ok(data) = frame.into_data() {
                decoder.push(&data);
                while let Some(f) = decoder.next_frame() {
                    output.write(&f.payload);
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| SandboxError::Run(e.to_string()))?;
        Ok(match inspect.exit_code {
            Some(code) if !inspect.running => RunExit::code(code as i32),
            // Exec gone with the container
            _ => RunExit::signaled(9),
        })
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.mark_killed();
        let Some(container_id) = handle.container_id.as_deref() else {
            return Ok(());
        };
        match self.client.kill_container(container_id).await {
            Ok(Removal::Done) => debug!(container_id = %container_id, "container killed"),
            Ok(Removal::AlreadyGone) => debug!(container_id = %container_id, "container already stopped"),
            Err(e) => return Err(SandboxError::Kill(e.to_string())),
        }
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.mark_killed();
        if let Some(container_id) = handle.container_id.as_deref() {
            match self.client.remove_container(container_id).await {
                Ok(Removal::Done) => debug!(container_id = %container_id, "container removed"),
                Ok(Removal::AlreadyGone) => {
                    warn!(container_id = %container_id, "container already removed")
                }
                Err(e) => return Err(SandboxError::Destroy(e.to_string())),
            }
        }
        self.dirs.remove(&handle.sandbox_id).await?;
        handle.mark_destroyed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::ResourceLimits;
    use crate::conversation::ConversationKey;

    fn backend() -> DockerBackend {
        DockerBackend::new(DockerConfig::default(), "/tmp/codevisor-test")
    }

    fn spec() -> SandboxSpec {
        SandboxSpec {
            sandbox_id: "sbx-d".into(),
            conversation_key: ConversationKey::new("chat 1"),
            limits: ResourceLimits::new(0.5, 256, 32),
        }
    }

    #[test]
    fn test_container_spec_is_locked_down() {
        let payload = backend().container_spec(&spec(), Path::new("/data/s"), Path::new("/data/u"));
        let host = &payload.host_config;
        assert_eq!(host.cap_drop, vec!["ALL"]);
        assert!(host.readonly_rootfs);
        assert_eq!(host.security_opt, vec!["no-new-privileges"]);
        assert_eq!(host.memory, 256 * 1024 * 1024);
        assert_eq!(host.nano_cpus, 500_000_000);
        assert!(host.binds.contains(&"/data/u:/mnt/input:ro".to_string()));
        assert!(host.binds.contains(&"/data/s:/mnt/shared:rw".to_string()));
        assert_eq!(host.extra_hosts, vec!["host.docker.internal:host-gateway"]);
        assert_eq!(payload.user, "65534:65534");
    }

    #[test]
    fn test_exec_spec_passes_routing_env() {
        let program = ProgramBundle {
            source: String::new(),
            env: vec![("CODEVISOR_SANDBOX_ID".into(), "sbx-d".into())],
            preamble_lines: 0,
            body: String::new(),
        };
        let exec = backend().exec_spec(&program);
        assert_eq!(exec.cmd.last().unwrap(), "/mnt/shared/.codevisor/program.py");
        assert!(exec.env.contains(&"CODEVISOR_SANDBOX_ID=sbx-d".to_string()));
        assert!(!exec.tty);
    }

    #[test]
    fn test_bridge_url_uses_host_alias() {
        let addr: SocketAddr = "0.0.0.0:7878".parse().unwrap();
        assert_eq!(backend().bridge_url(addr), "http://host.docker.internal:7878");
    }

    #[tokio::test]
    #[ignore = "Requires a running Docker daemon and the python image"]
    async fn test_docker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DockerBackend::new(DockerConfig::default(), dir.path());
        backend.init().await.unwrap();
        let handle = backend.create(&spec()).await.unwrap();
        let sink = OutputSink::new(1000, crate::sandbox::TruncateFrom::Start);
        let program = ProgramBundle {
            source: "import sys\nprint('out')\nprint('err', file=sys.stderr)\nsys.exit(4)\n".into(),
            env: vec![],
            preamble_lines: 0,
            body: String::new(),
        };
        let exit = backend.run(&handle, &program, &sink).await.unwrap();
        assert_eq!(exit, RunExit::code(4));
        let text = sink.finish().text;
        assert!(text.contains("out") && text.contains("err"));
        backend.kill(&handle).await.unwrap();
        backend.kill(&handle).await.unwrap();
        backend.destroy(&handle).await.unwrap();
    }
}
