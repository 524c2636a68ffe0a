//! cgroups v2 resource isolation module
//!
//! Kernel-enforced CPU, memory and pid ceilings for process-backed
//! sandboxes. A runaway program cannot starve the host or its neighbours
//! once its process group has been moved into its sandbox's cgroup.
//!
//! # Example Usage
//!
//! ```ignore
//! use codevisor::cgroups::{CgroupManager, ResourceLimits};
//!
//! let cgroups = CgroupManager::new()?;
//! cgroups.create("sbx-1", &ResourceLimits::new(1.0, 512, 128))?;
//! cgroups.add_process("sbx-1", child_pid)?;
//! cgroups.destroy("sbx-1")?;
//! ```

pub mod manager;

pub use manager::{CgroupManager, ResourceLimits};
