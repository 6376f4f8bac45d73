//! Host checks run before the pipeline starts.

use crate::config::Config;
use crate::qemu::QEMU_BINARY;
use crate::squashfs::SQFSTAR;
use anyhow::{bail, Result};
use std::path::Path;
use tracing::{info, warn};

/// A host program the pipeline will start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tool {
    pub name: &'static str,
    /// Distribution package that usually provides it.
    pub package: &'static str,
}

const GIT: Tool = Tool {
    name: "git",
    package: "git",
};
const BASH: Tool = Tool {
    name: "bash",
    package: "bash",
};
const MAKE: Tool = Tool {
    name: "make",
    package: "make",
};
const CURL: Tool = Tool {
    name: "curl",
    package: "curl",
};
const SQUASHFS: Tool = Tool {
    name: SQFSTAR,
    package: "squashfs-tools",
};
const QEMU: Tool = Tool {
    name: QEMU_BINARY,
    package: "qemu-system-x86",
};

/// Tools this run will need. `git` is only needed for the first checkout and
/// `bash` (for `scripts/config`) only until `.config` exists.
pub fn required_tools(config: &Config, launch: bool) -> Vec<Tool> {
    let mut tools = Vec::new();
    if !config.kernel_dir.exists() {
        tools.push(GIT);
    }
    if !config.config_file().exists() {
        tools.push(BASH);
    }
    tools.extend([MAKE, CURL, SQUASHFS]);
    if launch {
        tools.push(QEMU);
    }
    tools
}

/// Every tool for which `lookup` finds nothing.
pub fn missing_tools<F>(tools: &[Tool], lookup: F) -> Vec<Tool>
where
    F: Fn(&str) -> bool,
{
    tools.iter().copied().filter(|t| !lookup(t.name)).collect()
}

/// Fail listing every missing tool at once.
pub fn check(config: &Config, launch: bool) -> Result<()> {
    let tools = required_tools(config, launch);
    let missing = missing_tools(&tools, |name| which::which(name).is_ok());

    if !missing.is_empty() {
        for tool in &missing {
            warn!(
                tool = tool.name,
                package = tool.package,
                "not found on PATH"
            );
        }
        let names: Vec<_> = missing.iter().map(|t| t.name).collect();
        let packages: Vec<_> = missing.iter().map(|t| t.package).collect();
        bail!(
            "Missing tools: {} (install: {})",
            names.join(", "),
            packages.join(" ")
        );
    }

    if launch && !Path::new("/dev/kvm").exists() {
        warn!("/dev/kvm not found, QEMU will refuse -accel kvm");
    }
    info!(tools = tools.len(), "preflight checks passed");
    Ok(())
}
