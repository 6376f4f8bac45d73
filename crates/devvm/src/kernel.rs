//! Linux kernel workspace: checkout, one-time configuration, build.

use crate::cache::{ArtifactCache, Probe};
use crate::config::Config;
use crate::exec::{Invocation, ToolRunner};
use crate::kconfig;
use crate::pipeline::StageOutcome;
use crate::util::remove_if_exists;
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Make target producing [`crate::config::KERNEL_IMAGE`].
pub const IMAGE_TARGET: &str = "bzImage";

/// Worker counts handed to `make`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parallelism {
    /// Compile jobs, oversubscribed 1.5x.
    pub jobs: usize,
    /// Load average cap, which keeps the link steps at one per core.
    pub load: usize,
}

impl Parallelism {
    pub fn for_cores(cores: usize) -> Self {
        let cores = cores.max(1);
        Self {
            jobs: (cores * 3 / 2).max(1),
            load: cores,
        }
    }
}

fn make(dir: &Path) -> Invocation {
    Invocation::new("make").current_dir(dir)
}

/// Clone the kernel tree if the workspace does not exist.
pub fn acquire_source<P: Probe>(
    config: &Config,
    cache: &ArtifactCache<P>,
    runner: &mut dyn ToolRunner,
) -> Result<StageOutcome> {
    if cache.is_present(&config.kernel_dir) {
        debug!(path = %config.kernel_dir.display(), "kernel workspace present");
        return Ok(StageOutcome::Skipped);
    }

    if let Some(parent) = config.kernel_dir.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    info!(url = %config.kernel_git_url, "cloning kernel source");
    let clone = Invocation::new("git")
        .args(["clone", "--depth", "1"])
        .arg(&config.kernel_git_url)
        .arg(&config.kernel_dir);
    runner.run(&clone).context("Failed to clone kernel source")?;
    Ok(StageOutcome::Ran)
}

/// Create `.config` once: defconfig, forced overrides, then `olddefconfig`.
///
/// An existing `.config` is never touched, even when the overrides change.
pub fn configure<P: Probe>(
    config: &Config,
    cache: &ArtifactCache<P>,
    runner: &mut dyn ToolRunner,
) -> Result<StageOutcome> {
    let config_file = config.config_file();
    if cache.is_present(&config_file) {
        debug!(path = %config_file.display(), "kernel config present, leaving it alone");
        return Ok(StageOutcome::Skipped);
    }

    info!(path = %config_file.display(), "generating kernel config");
    let result = write_config(config, runner);
    if result.is_err() {
        // A half-written config would be mistaken for a finished one.
        remove_if_exists(&config_file)?;
    }
    result.map(|()| StageOutcome::Ran)
}

fn write_config(config: &Config, runner: &mut dyn ToolRunner) -> Result<()> {
    let dir = &config.kernel_dir;
    runner
        .run(&make(dir).arg("defconfig"))
        .context("make defconfig failed")?;

    let mut overrides = Invocation::new("bash")
        .current_dir(dir)
        .args(["scripts/config", "--file", ".config"]);
    for option in kconfig::enabled_overrides() {
        overrides = overrides.args(["--enable", option]);
    }
    overrides = overrides.args(["--disable", kconfig::DISABLED_OPTION]);
    runner
        .run(&overrides)
        .context("Failed to apply kernel config overrides")?;

    let path = config.config_file();
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", kconfig::APPENDED_LINE)
        .with_context(|| format!("Failed to append to {}", path.display()))?;

    runner
        .run(&make(dir).arg("olddefconfig"))
        .context("make olddefconfig failed")?;
    Ok(())
}

/// The `make` command that builds the kernel image.
pub fn build_invocation(dir: &Path, parallelism: Parallelism) -> Invocation {
    make(dir)
        .arg(format!("-j{}", parallelism.jobs))
        .arg(format!("-l{}", parallelism.load))
        .arg(IMAGE_TARGET)
}

/// Build the kernel image. Never skipped: the source may have changed.
pub fn build(config: &Config, runner: &mut dyn ToolRunner) -> Result<StageOutcome> {
    let parallelism = Parallelism::for_cores(config.cores);
    info!(
        jobs = parallelism.jobs,
        load = parallelism.load,
        "building kernel"
    );
    runner
        .run(&build_invocation(&config.kernel_dir, parallelism))
        .context("Kernel build failed")?;

    let image = config.kernel_image();
    if !image.exists() {
        bail!("Kernel build finished but {} is missing", image.display());
    }
    info!(path = %image.display(), "kernel image ready");
    Ok(StageOutcome::Ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallelism_ratios() {
        let p = Parallelism::for_cores(8);
        assert_eq!((p.jobs, p.load), (12, 8));
        let p = Parallelism::for_cores(3);
        assert_eq!((p.jobs, p.load), (4, 3));
    }

    #[test]
    fn test_parallelism_single_core() {
        for cores in [0, 1] {
            let p = Parallelism::for_cores(cores);
            assert_eq!((p.jobs, p.load), (1, 1));
        }
    }

    #[test]
    fn test_build_invocation() {
        let inv = build_invocation(Path::new("/src/linux"), Parallelism::for_cores(4));
        assert_eq!(inv.program(), "make");
        assert_eq!(inv.args_lossy(), vec!["-j6", "-l4", "bzImage"]);
        assert_eq!(inv.cwd(), Some(Path::new("/src/linux")));
    }
}
