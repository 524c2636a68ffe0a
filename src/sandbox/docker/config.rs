//! Docker Engine API payloads and backend configuration

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Docker backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket_path: PathBuf,
    pub image: String,
    /// Network sandboxes are attached to, created on first use
    pub network: String,
    /// Non-root identity inside the container
    pub user: String,
    /// Hostname under which the bridge is reachable from containers
    pub bridge_host: String,
    /// Size of the writable /tmp
    pub tmpfs_size_mb: u64,
    pub interpreter: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            image: "python:3.12-slim".to_string(),
            network: "codevisor-internal".to_string(),
            user: "65534:65534".to_string(),
            bridge_host: "host.docker.internal".to_string(),
            tmpfs_size_mb: 64,
            interpreter: vec!["python3".to_string(), "-u".to_string()],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreate {
    pub image: String,
    pub cmd: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
    pub host_config: HostConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub memory: u64,
    pub memory_swap: u64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub readonly_rootfs: bool,
    pub tmpfs: HashMap<String, String>,
    pub binds: Vec<String>,
    pub network_mode: String,
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkCreate {
    pub name: String,
    pub driver: String,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreate {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub attach_stdin: bool,
    pub tty: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecStart {
    pub detach: bool,
    pub tty: bool,
}

/// `{"Id": "..."}` returned by create endpoints
#[derive(Debug, Deserialize)]
pub struct IdResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecInspect {
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "ExitCode")]
    pub exit_code: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_create_field_names() {
        let payload = ExecCreate {
            cmd: vec!["python3".into()],
            env: vec!["A=1".into()],
            working_dir: "/mnt/shared".into(),
            attach_stdout: true,
            attach_stderr: true,
            attach_stdin: false,
            tty: false,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["AttachStdout"], true);
        assert_eq!(json["WorkingDir"], "/mnt/shared");
        assert_eq!(json["Cmd"][0], "python3");
    }

    #[test]
    fn test_host_config_field_names() {
        let host = HostConfig {
            memory: 1,
            memory_swap: 1,
            nano_cpus: 1,
            pids_limit: 1,
            cap_drop: vec!["ALL".into()],
            security_opt: vec!["no-new-privileges".into()],
            readonly_rootfs: true,
            tmpfs: HashMap::new(),
            binds: vec![],
            network_mode: "none".into(),
            extra_hosts: vec![],
        };
        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["CapDrop"][0], "ALL");
        assert_eq!(json["ReadonlyRootfs"], true);
        assert_eq!(json["NanoCpus"], 1);
    }

    #[test]
    fn test_exec_inspect_parses() {
        let inspect: ExecInspect =
            serde_json::from_str(r#"{"Running": false, "ExitCode": 2, "Pid": 10}"#).unwrap();
        assert!(!inspect.running);
        assert_eq!(inspect.exit_code, Some(2));
    }
}
