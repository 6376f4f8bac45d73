//! # devvm
//!
//! Build a kernel and boot it in a throwaway VM with the current directory
//! shared at `/mnt/host`.
//!
//! ## Usage
//!
//! ```bash
//! devvm                          # provision everything and boot
//! devvm ~/src/linux - -s -S      # custom workspace, extra QEMU args
//! devvm --no-launch              # provision only
//! devvm --status [--json]        # show artifact state
//! devvm --clean                  # drop generated images
//! ```

use anyhow::Result;
use clap::Parser;
use devvm::cache::ArtifactCache;
use devvm::config::{Config, Overrides};
use devvm::exec::SystemRunner;
use devvm::{preflight, status, Pipeline};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "devvm",
    version,
    about = "Provision and boot a disposable kernel development VM"
)]
struct Cli {
    /// Build everything but do not start the VM
    #[arg(long)]
    no_launch: bool,

    /// Show which artifacts exist and are valid, then exit
    #[arg(long, conflicts_with = "clean")]
    status: bool,

    /// Print the status report as JSON
    #[arg(long, requires = "status")]
    json: bool,

    /// Remove generated images (the kernel tree and download are kept)
    #[arg(long)]
    clean: bool,

    /// Do not check for required host tools
    #[arg(long)]
    skip_preflight: bool,

    /// Log filter
    #[arg(long, env = "DEVVM_LOG", default_value = "info")]
    log: String,

    /// Kernel workspace ("-" for $DEVVM_KERNEL_DIR or ./linux)
    kernel_dir: Option<String>,

    /// Artifacts directory ("-" for $DEVVM_ARTIFACTS_DIR or ./.devvm)
    artifacts_dir: Option<String>,

    /// Passed to QEMU unchanged
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    qemu_args: Vec<String>,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to the serial console once QEMU starts.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

/// QEMU's exit status as a process exit status; out-of-range codes and
/// signal terminations map to 1.
fn exit_status(code: Option<i32>) -> u8 {
    code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let config = Config::from_process(Overrides {
        kernel_dir: cli.kernel_dir,
        artifacts_dir: cli.artifacts_dir,
        hypervisor_args: cli.qemu_args,
    })?;

    if cli.status {
        let statuses = status::collect(&config, &ArtifactCache::system());
        if cli.json {
            println!("{}", status::render_json(&statuses)?);
        } else {
            print!("{}", status::render_text(&statuses));
        }
        return Ok(ExitCode::SUCCESS);
    }

    if cli.clean {
        let removed = status::clean(&config)?;
        info!(count = removed.len(), "clean complete");
        return Ok(ExitCode::SUCCESS);
    }

    let launch = !cli.no_launch;
    if !cli.skip_preflight {
        preflight::check(&config, launch)?;
    }

    let mut runner = SystemRunner;
    let mut pipeline = Pipeline::new(&config, &mut runner);
    if !launch {
        pipeline = pipeline.without_launch();
    }
    let report = pipeline.run()?;

    if report.launched {
        Ok(ExitCode::from(exit_status(report.exit_code)))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
