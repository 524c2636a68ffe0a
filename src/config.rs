//! TOML configuration
//!
//! Every section and field has a default, so an empty file (or no file)
//! is a valid configuration. `${VAR}` references are expanded from the
//! environment before parsing.
//!
//! ```toml
//! [governor]
//! max_concurrent_runs = 3
//! run_timeout_secs = 60
//!
//! [sandbox]
//! backend = "docker"
//!
//! [sandbox.docker]
//! image = "python:3.12-slim"
//!
//! [agent]
//! ollama_url = "${OLLAMA_URL}"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::agent::AgentConfig;
use crate::cgroups::ResourceLimits;
use crate::governor::GovernorConfig;
use crate::rpc::BridgeConfig;
use crate::sandbox::docker::DockerConfig;
use crate::sandbox::process::ProcessBackendConfig;
use crate::sandbox::TruncateFrom;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to expand environment variables: {0}")]
    Expand(String),
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub governor: GovernorSection,
    pub sandbox: SandboxSection,
    pub bridge: BridgeSection,
    pub agent: AgentSection,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub max_concurrent_runs: usize,
    pub run_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Background sweep threshold
    pub max_idle_secs: u64,
    pub max_sandbox_age_secs: u64,
    pub output_limit_chars: usize,
    pub truncate_from: TruncateFrom,
    /// Unset waits for a slot indefinitely
    pub admission_timeout_secs: Option<u64>,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            run_timeout_secs: 60,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            max_idle_secs: 1800,
            max_sandbox_age_secs: 3600,
            output_limit_chars: 8000,
            truncate_from: TruncateFrom::Start,
            admission_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Docker,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: u32,
    pub run_as_uid: Option<u32>,
    pub run_as_gid: Option<u32>,
    pub interpreter: Vec<String>,
    pub cgroups: bool,
    /// Let the process backend run programs as the host user with the
    /// host's network
    pub insecure: bool,
    pub docker: DockerConfig,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            data_dir: PathBuf::from("./data"),
            memory_mb: 512,
            cpu_cores: 1.0,
            pids_limit: 128,
            run_as_uid: None,
            run_as_gid: None,
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            cgroups: true,
            insecure: false,
            docker: DockerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub listen_addr: SocketAddr,
    pub rate_limit_burst: u64,
    pub rate_limit_per_sec: f64,
    pub max_body_bytes: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            rate_limit_burst: 50,
            rate_limit_per_sec: 10.0,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_retries: usize,
    pub max_chained_turns: usize,
    pub model: String,
    pub ollama_url: String,
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_chained_turns: 5,
            model: "qwen3".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub otlp_endpoint: Option<String>,
    pub json_logs: bool,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::env(content).map_err(|e| ConfigError::Expand(e.to_string()))?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.governor;
        if g.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid("governor.max_concurrent_runs must be at least 1".into()));
        }
        if g.output_limit_chars == 0 {
            return Err(ConfigError::Invalid("governor.output_limit_chars must be at least 1".into()));
        }
        if g.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid("governor.run_timeout_secs must be at least 1".into()));
        }
        if g.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("governor.sweep_interval_secs must be at least 1".into()));
        }
        if self.sandbox.interpreter.is_empty() {
            return Err(ConfigError::Invalid("sandbox.interpreter must not be empty".into()));
        }
        if self.sandbox.memory_mb == 0 || self.sandbox.cpu_cores <= 0.0 || self.sandbox.pids_limit == 0 {
            return Err(ConfigError::Invalid("sandbox resource limits must be positive".into()));
        }
        if self.sandbox.backend == BackendKind::Process
            && self.sandbox.run_as_uid.is_none()
            && !self.sandbox.insecure
        {
            return Err(ConfigError::Invalid(
                "the process backend needs sandbox.run_as_uid, or sandbox.insecure = true".into(),
            ));
        }
        if self.bridge.rate_limit_burst == 0 || self.bridge.rate_limit_per_sec <= 0.0 {
            return Err(ConfigError::Invalid("bridge rate limit must be positive".into()));
        }
        Ok(())
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.sandbox.cpu_cores, self.sandbox.memory_mb, self.sandbox.pids_limit)
    }

    pub fn governor_config(&self) -> GovernorConfig {
        let g = &self.governor;
        GovernorConfig {
            max_concurrent_runs: g.max_concurrent_runs,
            run_timeout: Duration::from_secs(g.run_timeout_secs),
            idle_timeout: Duration::from_secs(g.idle_timeout_secs),
            sweep_interval: Duration::from_secs(g.sweep_interval_secs),
            max_idle: Duration::from_secs(g.max_idle_secs),
            max_sandbox_age: Duration::from_secs(g.max_sandbox_age_secs),
            output_limit: g.output_limit_chars,
            truncate_from: g.truncate_from,
            admission_timeout: g.admission_timeout_secs.map(Duration::from_secs),
            limits: self.limits(),
            data_dir: self.sandbox.data_dir.clone(),
        }
    }

    pub fn process_backend_config(&self) -> ProcessBackendConfig {
        ProcessBackendConfig {
            data_dir: self.sandbox.data_dir.clone(),
            interpreter: self.sandbox.interpreter.clone(),
            run_as_uid: self.sandbox.run_as_uid,
            run_as_gid: self.sandbox.run_as_gid,
            cgroups: self.sandbox.cgroups,
            insecure: self.sandbox.insecure,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            rate_capacity: self.bridge.rate_limit_burst,
            rate_per_sec: self.bridge.rate_limit_per_sec,
            max_body_bytes: self.bridge.max_body_bytes,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_retries: self.agent.max_retries,
            max_chained_turns: self.agent.max_chained_turns,
            ..AgentConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.governor.max_concurrent_runs, 3);
        assert_eq!(config.sandbox.backend, BackendKind::Docker);
        assert!(!config.sandbox.insecure);
        assert_eq!(config.bridge.listen_addr.port(), 7878);
        assert_eq!(config.agent.max_retries, 3);
        assert!(config.telemetry.otlp_endpoint.is_none());
    }

    #[test]
    fn test_sections_and_env_expansion() {
        std::env::set_var("CODEVISOR_TEST_IMAGE", "python:3.11-alpine");
        let config = Config::from_toml(
            r#"
            [governor]
            max_concurrent_runs = 8
            truncate_from = "end"
            admission_timeout_secs = 30

            [sandbox]
            backend = "docker"
            memory_mb = 256

            [sandbox.docker]
            image = "${CODEVISOR_TEST_IMAGE}"
            "#,
        )
        .unwrap();

        assert_eq!(config.sandbox.backend, BackendKind::Docker);
        assert_eq!(config.sandbox.docker.image, "python:3.11-alpine");
        // Unset docker fields keep their defaults
        assert_eq!(config.sandbox.docker.network, "codevisor-internal");

        let governor = config.governor_config();
        assert_eq!(governor.max_concurrent_runs, 8);
        assert_eq!(governor.truncate_from, TruncateFrom::End);
        assert_eq!(governor.admission_timeout, Some(Duration::from_secs(30)));
        assert_eq!(governor.limits.memory_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_process_backend_settings() {
        let config = Config::from_toml(
            r#"
            [sandbox]
            backend = "process"
            run_as_uid = 65534
            run_as_gid = 65534
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.backend, BackendKind::Process);
        let process = config.process_backend_config();
        assert_eq!(process.run_as_uid, Some(65534));
        assert!(!process.insecure);
    }

    #[test]
    fn test_process_backend_needs_identity_or_opt_in() {
        assert!(matches!(
            Config::from_toml("[sandbox]\nbackend = \"process\""),
            Err(ConfigError::Invalid(_))
        ));
        let config = Config::from_toml("[sandbox]\nbackend = \"process\"\ninsecure = true").unwrap();
        assert!(config.process_backend_config().insecure);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(matches!(
            Config::from_toml("[governor]\nmax_concurrent_runs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[governor]\noutput_limit_chars = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[governor]\nrun_timeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let err = Config::from_toml("[agent]\nmodel = \"${CODEVISOR_SURELY_UNSET_VAR}\"").unwrap_err();
        assert!(matches!(err, ConfigError::Expand(_)));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/codevisor.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
