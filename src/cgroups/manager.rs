//! cgroup v2 limits for sandboxes
//!
//! Each sandbox gets its own cgroup under /sys/fs/cgroup/codevisor/{sandbox_id}/
//!
//! ```text
//! /sys/fs/cgroup/
//! └── codevisor/
//!     ├── sbx-0192.../
//!     │   ├── cpu.max        "100000 100000" = 1 core
//!     │   ├── memory.max     bytes
//!     │   ├── pids.max       fork-bomb ceiling
//!     │   └── cgroup.procs   pids bound to this cgroup
//!     └── sbx-0193.../
//! ```
//!
//! Requires write access to the cgroup hierarchy. Callers treat every
//! failure here as "run without cgroup limits" and log a warning.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const CGROUP_NAMESPACE: &str = "codevisor";

/// CPU period used for cpu.max, in microseconds
const CPU_PERIOD_US: u64 = 100_000;

/// Resource ceilings applied to one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Number of CPU cores (1.0 = one full core, 0.5 = half a core)
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub pids_max: u32,
}

impl ResourceLimits {
    pub fn new(cpu_cores: f64, memory_mb: u64, pids_max: u32) -> Self {
        Self {
            cpu_cores,
            memory_bytes: memory_mb * 1024 * 1024,
            pids_max,
        }
    }

    /// cpu.max contents: "quota period"
    pub fn cpu_max(&self) -> String {
        let quota = (self.cpu_cores * CPU_PERIOD_US as f64) as u64;
        format!("{} {}", quota.max(1000), CPU_PERIOD_US)
    }

    /// Docker's NanoCpus for the same ceiling
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0) as i64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(1.0, 512, 128)
    }
}

pub struct CgroupManager {
    base_path: PathBuf,
}

impl CgroupManager {
    /// Create the codevisor namespace under the cgroup root and enable the
    /// controllers sandboxes need
    pub fn new() -> io::Result<Self> {
        Self::with_base(PathBuf::from(CGROUP_ROOT).join(CGROUP_NAMESPACE))
    }

    pub fn with_base(base_path: PathBuf) -> io::Result<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }

        let subtree_control = base_path.join("cgroup.subtree_control");
        fs::write(&subtree_control, "+cpu +memory +pids")?;

        Ok(Self { base_path })
    }

    fn sandbox_path(&self, sandbox_id: &str) -> PathBuf {
        self.base_path.join(sandbox_id)
    }

    pub fn create(&self, sandbox_id: &str, limits: &ResourceLimits) -> io::Result<()> {
        let cgroup_path = self.sandbox_path(sandbox_id);
        fs::create_dir_all(&cgroup_path)?;

        fs::write(cgroup_path.join("cpu.max"), limits.cpu_max())?;
        fs::write(cgroup_path.join("memory.max"), limits.memory_bytes.to_string())?;
        fs::write(cgroup_path.join("pids.max"), limits.pids_max.to_string())?;

        Ok(())
    }

    /// Move a process into the sandbox's cgroup
    pub fn add_process(&self, sandbox_id: &str, pid: u32) -> io::Result<()> {
        fs::write(self.sandbox_path(sandbox_id).join("cgroup.procs"), pid.to_string())
    }

    /// Remove the cgroup. Fails while processes are still attached.
    pub fn destroy(&self, sandbox_id: &str) -> io::Result<()> {
        let cgroup_path = self.sandbox_path(sandbox_id);
        if cgroup_path.exists() {
            fs::remove_dir(&cgroup_path)?;
        }
        Ok(())
    }

    pub fn exists(&self, sandbox_id: &str) -> bool {
        self.sandbox_path(sandbox_id).exists()
    }

    pub fn get_memory_usage(&self, sandbox_id: &str) -> io::Result<u64> {
        let content = fs::read_to_string(self.sandbox_path(sandbox_id).join("memory.current"))?;
        content
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_megabytes() {
        let limits = ResourceLimits::new(1.5, 256, 64);
        assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(limits.cpu_max(), "150000 100000");
        assert_eq!(limits.nano_cpus(), 1_500_000_000);
    }

    #[test]
    fn test_cpu_max_has_floor() {
        assert_eq!(ResourceLimits::new(0.0, 1, 1).cpu_max(), "1000 100000");
    }

    #[test]
    fn test_create_writes_limit_files() {
        // A plain directory stands in for the cgroup hierarchy
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::with_base(dir.path().join("codevisor")).unwrap();
        manager.create("sbx-1", &ResourceLimits::new(1.0, 512, 128)).unwrap();

        let path = dir.path().join("codevisor/sbx-1");
        assert_eq!(fs::read_to_string(path.join("cpu.max")).unwrap(), "100000 100000");
        assert_eq!(fs::read_to_string(path.join("memory.max")).unwrap(), "536870912");
        assert_eq!(fs::read_to_string(path.join("pids.max")).unwrap(), "128");
        assert!(manager.exists("sbx-1"));
    }
}
