//! Resolved configuration.
//!
//! Built once at startup from the command line and the environment, then
//! passed by reference to every stage. Nothing else reads the environment.

use crate::boot::BootParams;
use crate::cache::is_sha256_hex;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

pub const KERNEL_DIR_ENV: &str = "DEVVM_KERNEL_DIR";
pub const ARTIFACTS_DIR_ENV: &str = "DEVVM_ARTIFACTS_DIR";
pub const ROOTFS_URL_ENV: &str = "DEVVM_ROOTFS_URL";
pub const ROOTFS_SHA256_ENV: &str = "DEVVM_ROOTFS_SHA256";

pub const DEFAULT_KERNEL_DIR: &str = "linux";
pub const DEFAULT_ARTIFACTS_DIR: &str = ".devvm";

/// Positional value meaning "use the default".
pub const PLACEHOLDER: &str = "-";

pub const KERNEL_GIT_URL: &str =
    "https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git";

/// Alpine minirootfs. Alpine publishes `<archive>.sha256` next to it.
const ALPINE_ROOTFS_URL: &str =
    "https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/x86_64/alpine-minirootfs-3.20.3-x86_64.tar.gz";

/// Kernel image path relative to the workspace.
pub const KERNEL_IMAGE: &str = "arch/x86/boot/bzImage";

/// A downloadable file checked against a SHA-256 digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub url: String,
    /// Pinned digest. `None` means the digest comes from the checksum file
    /// published at [`RemoteArtifact::checksum_url`].
    pub sha256: Option<String>,
    /// File name under the artifacts directory.
    pub file_name: String,
}

impl RemoteArtifact {
    pub fn alpine_minirootfs() -> Self {
        Self {
            url: ALPINE_ROOTFS_URL.to_string(),
            sha256: None,
            file_name: "alpine-minirootfs.tar.gz".to_string(),
        }
    }

    /// `sha256sum`-style file published next to the artifact.
    pub fn checksum_url(&self) -> String {
        format!("{}.sha256", self.url)
    }

    pub fn checksum_file_name(&self) -> String {
        format!("{}.sha256", self.file_name)
    }
}

/// Fixed hypervisor machine settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSettings {
    pub machine: String,
    pub accel: String,
    pub memory: String,
    pub cpu: String,
    pub smp: usize,
}

impl VmSettings {
    fn for_cores(cores: usize) -> Self {
        Self {
            machine: "q35".to_string(),
            accel: "kvm".to_string(),
            memory: "2G".to_string(),
            cpu: "host".to_string(),
            smp: cores.clamp(1, 8),
        }
    }
}

/// Values taken from the command line.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub kernel_dir: Option<String>,
    pub artifacts_dir: Option<String>,
    pub hypervisor_args: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Kernel source tree and build directory.
    pub kernel_dir: PathBuf,
    /// Downloaded archive and generated images.
    pub artifacts_dir: PathBuf,
    /// Host directory exported to the guest.
    pub host_share: PathBuf,
    pub kernel_git_url: String,
    pub base_archive: RemoteArtifact,
    pub boot: BootParams,
    pub vm: VmSettings,
    /// Host processor count used to size the kernel build.
    pub cores: usize,
    /// Passed to the hypervisor verbatim, after everything else.
    pub hypervisor_args: Vec<String>,
}

impl Config {
    /// Resolve from the real process environment and working directory.
    pub fn from_process(overrides: Overrides) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Self::resolve(overrides, |key| std::env::var(key).ok(), &cwd)
    }

    /// Resolve paths: explicit argument, then environment, then default.
    pub fn resolve<F>(overrides: Overrides, env: F, host_share: &Path) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kernel_dir = resolve_path(
            overrides.kernel_dir.as_deref(),
            env(KERNEL_DIR_ENV),
            DEFAULT_KERNEL_DIR,
        );
        let artifacts_dir = resolve_path(
            overrides.artifacts_dir.as_deref(),
            env(ARTIFACTS_DIR_ENV),
            DEFAULT_ARTIFACTS_DIR,
        );

        let mut base_archive = RemoteArtifact::alpine_minirootfs();
        if let Some(url) = non_empty(env(ROOTFS_URL_ENV)) {
            base_archive.url = url;
        }
        if let Some(sha256) = non_empty(env(ROOTFS_SHA256_ENV)) {
            base_archive.sha256 = Some(sha256.to_ascii_lowercase());
        }

        let cores = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1);

        let config = Self {
            kernel_dir: absolute(&kernel_dir)?,
            artifacts_dir: absolute(&artifacts_dir)?,
            host_share: absolute(host_share)?,
            kernel_git_url: KERNEL_GIT_URL.to_string(),
            base_archive,
            boot: BootParams::default(),
            vm: VmSettings::for_cores(cores),
            cores,
            hypervisor_args: overrides.hypervisor_args,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("kernel workspace", &self.kernel_dir),
            ("artifacts directory", &self.artifacts_dir),
        ] {
            if path.exists() && !path.is_dir() {
                bail!("{what} {} exists but is not a directory", path.display());
            }
        }
        if !self.host_share.is_dir() {
            bail!("host share {} is not a directory", self.host_share.display());
        }
        if let Some(digest) = &self.base_archive.sha256 {
            if !is_sha256_hex(digest) {
                bail!(
                    "{ROOTFS_SHA256_ENV} must be a 64 character hex digest, got {digest:?}"
                );
            }
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.kernel_dir.join(".config")
    }

    pub fn kernel_image(&self) -> PathBuf {
        self.kernel_dir.join(KERNEL_IMAGE)
    }

    pub fn base_archive_path(&self) -> PathBuf {
        self.artifacts_dir.join(&self.base_archive.file_name)
    }

    /// Local copy of the published checksum for the base archive.
    pub fn base_archive_checksum_path(&self) -> PathBuf {
        self.artifacts_dir.join(self.base_archive.checksum_file_name())
    }

    pub fn base_image(&self) -> PathBuf {
        self.artifacts_dir.join("rootfs.sqfs")
    }

    /// Intermediate tarball; only exists while the init image is packed.
    pub fn init_tar(&self) -> PathBuf {
        self.artifacts_dir.join("init.tar")
    }

    pub fn init_image(&self) -> PathBuf {
        self.artifacts_dir.join("init.sqfs")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_path(arg: Option<&str>, env: Option<String>, default: &str) -> PathBuf {
    match arg {
        Some(arg) if arg != PLACEHOLDER && !arg.is_empty() => PathBuf::from(arg),
        _ => non_empty(env).map_or_else(|| PathBuf::from(default), PathBuf::from),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))
}
