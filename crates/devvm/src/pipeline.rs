//! Ordered, resumable provisioning pipeline.
//!
//! Each stage decides for itself whether it has work to do (see
//! [`crate::cache`]), so re-running after a failure resumes at the first
//! stage whose output is missing. Any error stops the run immediately.

use crate::cache::{ArtifactCache, FsProbe, Probe};
use crate::config::Config;
use crate::exec::ToolRunner;
use crate::kconfig::{self, KernelConfig, MissingOptions};
use crate::{initimage, kernel, qemu, rootfs};
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    AcquireSource,
    Configure,
    ValidateConfig,
    Build,
    FetchBaseArchive,
    PackageBaseImage,
    AssembleInitImage,
    Launch,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 8] = [
        Stage::AcquireSource,
        Stage::Configure,
        Stage::ValidateConfig,
        Stage::Build,
        Stage::FetchBaseArchive,
        Stage::PackageBaseImage,
        Stage::AssembleInitImage,
        Stage::Launch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::AcquireSource => "acquire-source",
            Stage::Configure => "configure",
            Stage::ValidateConfig => "validate-config",
            Stage::Build => "build",
            Stage::FetchBaseArchive => "fetch-base-archive",
            Stage::PackageBaseImage => "package-base-image",
            Stage::AssembleInitImage => "assemble-init-image",
            Stage::Launch => "launch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage did on this run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Ran,
    /// Output already present (and valid, where hash-gated).
    Skipped,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(
        "{source}\nDelete {} to regenerate it with the required options",
        .config_file.display()
    )]
    Validation {
        config_file: PathBuf,
        #[source]
        source: MissingOptions,
    },
}

/// Per-stage outcomes of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub stages: Vec<(Stage, StageOutcome)>,
    /// Hypervisor exit code; `None` when not launched or killed by a signal.
    pub exit_code: Option<i32>,
    pub launched: bool,
}

impl PipelineReport {
    pub fn outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| *outcome)
    }

    pub fn ran(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages
            .iter()
            .filter(|(_, outcome)| *outcome == StageOutcome::Ran)
            .map(|(stage, _)| *stage)
    }
}

pub struct Pipeline<'a, P: Probe = FsProbe> {
    config: &'a Config,
    cache: ArtifactCache<P>,
    runner: &'a mut dyn ToolRunner,
    launch: bool,
}

impl<'a> Pipeline<'a, FsProbe> {
    pub fn new(config: &'a Config, runner: &'a mut dyn ToolRunner) -> Self {
        Self::with_cache(config, ArtifactCache::system(), runner)
    }
}

impl<'a, P: Probe> Pipeline<'a, P> {
    pub fn with_cache(
        config: &'a Config,
        cache: ArtifactCache<P>,
        runner: &'a mut dyn ToolRunner,
    ) -> Self {
        Self {
            config,
            cache,
            runner,
            launch: true,
        }
    }

    /// Stop after the init image; do not start the VM.
    #[must_use]
    pub fn without_launch(mut self) -> Self {
        self.launch = false;
        self
    }

    pub fn run(&mut self) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        for stage in Stage::ALL {
            if stage == Stage::Launch && !self.launch {
                info!("launch disabled, artifacts are ready");
                break;
            }
            info!(stage = %stage, "stage start");
            let outcome = self.run_stage(stage, &mut report)?;
            info!(stage = %stage, ?outcome, "stage done");
            report.stages.push((stage, outcome));
        }
        Ok(report)
    }

    fn run_stage(&mut self, stage: Stage, report: &mut PipelineReport) -> Result<StageOutcome> {
        let config = self.config;
        let cache = &self.cache;
        let runner = &mut *self.runner;
        match stage {
            Stage::AcquireSource => kernel::acquire_source(config, cache, runner),
            Stage::Configure => kernel::configure(config, cache, runner),
            Stage::ValidateConfig => validate(config),
            Stage::Build => kernel::build(config, runner),
            Stage::FetchBaseArchive => rootfs::fetch_base_archive(config, cache, runner),
            Stage::PackageBaseImage => rootfs::package_base_image(config, cache, runner),
            Stage::AssembleInitImage => initimage::assemble(config, cache, runner),
            Stage::Launch => {
                report.exit_code = qemu::launch(config, runner)?;
                report.launched = true;
                Ok(StageOutcome::Ran)
            }
        }
    }
}

/// Check the workspace `.config` against every requirement group.
pub fn validate(config: &Config) -> Result<StageOutcome> {
    let config_file = config.config_file();
    let kernel_config = KernelConfig::load(&config_file)?;
    if let Err(source) = kconfig::check_all(&kernel_config, kconfig::REQUIRED_GROUPS) {
        return Err(PipelineError::Validation {
            config_file,
            source,
        }
        .into());
    }
    Ok(StageOutcome::Ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.first(), Some(&"acquire-source"));
        assert_eq!(names.last(), Some(&"launch"));
        let validate = names.iter().position(|n| *n == "validate-config").unwrap();
        let build = names.iter().position(|n| *n == "build").unwrap();
        assert!(validate < build);
    }

    #[test]
    fn test_report_queries() {
        let report = PipelineReport {
            stages: vec![
                (Stage::AcquireSource, StageOutcome::Skipped),
                (Stage::Build, StageOutcome::Ran),
            ],
            exit_code: None,
            launched: false,
        };
        assert_eq!(report.outcome(Stage::Build), Some(StageOutcome::Ran));
        assert_eq!(report.outcome(Stage::Launch), None);
        assert_eq!(report.ran().collect::<Vec<_>>(), vec![Stage::Build]);
    }

    #[test]
    fn test_validation_error_suggests_regenerating() {
        let err = PipelineError::Validation {
            config_file: PathBuf::from("/k/.config"),
            source: MissingOptions(vec![kconfig::MissingOption {
                group: "base boot",
                option: "VIRTIO_BLK",
            }]),
        };
        let text = err.to_string();
        assert!(text.contains("CONFIG_VIRTIO_BLK"));
        assert!(text.contains("Delete /k/.config"));
    }
}
