//! Kernel `.config` requirement checks.
//!
//! The VM only boots if the kernel has a handful of built-in options. They
//! are grouped by what they are needed for, and every group is checked before
//! anything is reported so a single run lists every missing option.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::error;

/// Options that must be built in, with the reason they are needed.
#[derive(Clone, Copy, Debug)]
pub struct RequirementGroup {
    pub name: &'static str,
    pub rationale: &'static str,
    pub options: &'static [&'static str],
}

/// Required options, without the `CONFIG_` prefix.
pub const REQUIRED_GROUPS: &[RequirementGroup] = &[
    RequirementGroup {
        name: "base boot",
        rationale: "boot from virtio block devices with a serial console",
        options: &[
            "VIRTIO",
            "VIRTIO_PCI",
            "VIRTIO_BLK",
            "SERIAL_8250",
            "SERIAL_8250_CONSOLE",
            "DEVTMPFS",
            "DEVTMPFS_MOUNT",
            "TMPFS",
            "BINFMT_SCRIPT",
        ],
    },
    RequirementGroup {
        name: "host passthrough",
        rationale: "mount the host directory over 9p/virtio",
        options: &["NET_9P", "NET_9P_VIRTIO", "9P_FS", "9P_FS_POSIX_ACL"],
    },
    RequirementGroup {
        name: "overlay and compression",
        rationale: "mount the zstd squashfs images under a writable overlay",
        options: &["SQUASHFS", "SQUASHFS_ZSTD", "OVERLAY_FS"],
    },
    RequirementGroup {
        name: "guest networking",
        rationale: "bring up virtio-net and lease an address over DHCP",
        options: &["NET", "INET", "PACKET", "VIRTIO_NET"],
    },
    RequirementGroup {
        name: "debugging aids",
        rationale: "attach gdb with symbols and helper scripts",
        options: &[
            "DEBUG_INFO_DWARF_TOOLCHAIN_DEFAULT",
            "GDB_SCRIPTS",
            "KALLSYMS",
            "MAGIC_SYSRQ",
        ],
    },
];

/// Disabled on first configuration; it forces debug info off.
pub const DISABLED_OPTION: &str = "DEBUG_INFO_NONE";

/// Appended verbatim on first configuration. It selects a choice member,
/// which `scripts/config --enable` cannot do on its own.
pub const APPENDED_LINE: &str = "CONFIG_DEBUG_INFO_DWARF_TOOLCHAIN_DEFAULT=y";

/// Options switched on with `scripts/config --enable` on first configuration.
pub fn enabled_overrides() -> impl Iterator<Item = &'static str> {
    let appended = APPENDED_LINE
        .strip_prefix("CONFIG_")
        .and_then(|l| l.strip_suffix("=y"))
        .unwrap_or_default();
    REQUIRED_GROUPS
        .iter()
        .flat_map(|g| g.options.iter().copied())
        .filter(move |o| *o != appended)
}

/// A parsed kernel `.config`.
#[derive(Clone, Debug, Default)]
pub struct KernelConfig {
    enabled: HashSet<String>,
}

impl KernelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read kernel config {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Keep only the literal `CONFIG_<NAME>=y` assignments.
    pub fn parse(text: &str) -> Self {
        let enabled = text
            .lines()
            .map(str::trim)
            .filter_map(|line| line.strip_prefix("CONFIG_")?.strip_suffix("=y"))
            .map(str::to_string)
            .collect();
        Self { enabled }
    }

    /// `=m`, `is not set` and absent all count as not enabled.
    pub fn is_enabled(&self, option: &str) -> bool {
        self.enabled.contains(option)
    }
}

/// One required option that is not built in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingOption {
    pub group: &'static str,
    pub option: &'static str,
}

impl fmt::Display for MissingOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CONFIG_{} ({})", self.option, self.group)
    }
}

/// Every required option the configuration lacks.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("kernel config is missing {} required option(s):\n{}", .0.len(), list(.0))]
pub struct MissingOptions(pub Vec<MissingOption>);

impl MissingOptions {
    pub fn options(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|m| m.option)
    }
}

fn list(missing: &[MissingOption]) -> String {
    missing
        .iter()
        .map(|m| format!("  {m}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Missing options of a single group, in declaration order.
pub fn check_group(config: &KernelConfig, group: &RequirementGroup) -> Vec<MissingOption> {
    group
        .options
        .iter()
        .filter(|o| !config.is_enabled(o))
        .map(|&option| MissingOption {
            group: group.name,
            option,
        })
        .collect()
}

/// Check every group, logging each missing option, and fail only after all
/// groups have been checked.
pub fn check_all(config: &KernelConfig, groups: &[RequirementGroup]) -> Result<(), MissingOptions> {
    let mut missing = Vec::new();
    for group in groups {
        let group_missing = check_group(config, group);
        for m in &group_missing {
            error!(
                group = group.name,
                needed_for = group.rationale,
                "CONFIG_{} is not enabled",
                m.option
            );
        }
        missing.extend(group_missing);
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MissingOptions(missing))
    }
}
