//! Linux capability dropping for sandbox children
//!
//! The process backend runs untrusted programs as ordinary child processes.
//! When the host runs as root the child would inherit every capability, so
//! the child clears its sets between fork and exec.
//!
//! ```text
//!   Bounding     ─ drop all   (cannot be regained through setuid binaries)
//!   Ambient      ─ clear      (not inherited across exec)
//!   Inheritable  ─ clear
//!   Permitted    ─ clear
//!   Effective    ─ clear
//! ```
//!
//! Non-root hosts have nothing to drop; failures there are expected and
//! ignored in [`CapabilityDropper::apply`].

use std::io;

/// Drops Linux capabilities from the calling process
pub struct CapabilityDropper {
    caps_to_drop: Vec<caps::Capability>,
}

impl CapabilityDropper {
    pub fn new() -> Self {
        Self { caps_to_drop: Vec::new() }
    }

    /// Every capability the kernel knows about
    pub fn all() -> Self {
        Self {
            caps_to_drop: caps::all().into_iter().collect(),
        }
    }

    pub fn drop_cap(&mut self, cap: caps::Capability) -> &mut Self {
        self.caps_to_drop.push(cap);
        self
    }

    /// Shrink the bounding set while CAP_SETPCAP is still held
    ///
    /// Call before switching to an unprivileged uid; afterwards the drop
    /// silently does nothing.
    pub fn drop_bounding(&self) {
        for &cap in &self.caps_to_drop {
            let _ = caps::drop(None, caps::CapSet::Bounding, cap);
        }
    }

    /// Best-effort drop, for use in a forked child before exec
    ///
    /// Bounding-set drops need CAP_SETPCAP and are skipped silently when
    /// unavailable; clearing the process's own sets always succeeds for root.
    pub fn apply(&self) -> Result<(), io::Error> {
        self.drop_bounding();
        let _ = caps::clear(None, caps::CapSet::Ambient);
        for set in [caps::CapSet::Inheritable, caps::CapSet::Effective, caps::CapSet::Permitted] {
            for &cap in &self.caps_to_drop {
                if let Ok(true) = caps::has_cap(None, set, cap) {
                    caps::drop(None, set, cap)
                        .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    pub fn drop_count(&self) -> usize {
        self.caps_to_drop.len()
    }
}

impl Default for CapabilityDropper {
    fn default() -> Self {
        Self::all()
    }
}

/// Human-readable listing of the current process's capability sets
pub fn get_current_caps() -> Result<String, io::Error> {
    let mut output = String::from("Current process capabilities:\n");

    for (name, set) in [
        ("Effective", caps::CapSet::Effective),
        ("Permitted", caps::CapSet::Permitted),
        ("Inheritable", caps::CapSet::Inheritable),
    ] {
        output.push_str(&format!("  {}:", name));
        match caps::read(None, set) {
            Ok(caps) if caps.is_empty() => output.push_str(" (none)\n"),
            Ok(caps) => {
                output.push('\n');
                let mut names: Vec<String> = caps.iter().map(|c| c.to_string()).collect();
                names.sort();
                for cap in names {
                    output.push_str(&format!("    - {}\n", cap));
                }
            }
            Err(_) => output.push_str(" (unable to read)\n"),
        }
    }

    Ok(output)
}
