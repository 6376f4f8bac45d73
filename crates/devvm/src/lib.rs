//! # devvm
//!
//! Provision and boot a disposable kernel development VM.
//!
//! The pipeline clones and builds a kernel, packs an Alpine minirootfs into a
//! squashfs image, assembles a tiny init image holding the two boot-stage
//! scripts, and boots everything under QEMU/KVM with the current directory
//! shared into the guest over 9p.
//!
//! ## Layout
//!
//! - [`config`] - resolved paths and settings, built once at startup
//! - [`kconfig`] - kernel `.config` requirement checks
//! - [`cache`] - existence and hash gates for every expensive step
//! - [`exec`] - the seam through which external tools are started
//! - [`kernel`] - source checkout, configuration and build
//! - [`rootfs`] - base archive download and base image packing
//! - [`squashfs`] - `sqfstar` wrapper shared by both images
//! - [`boot`] - stage 1 / stage 2 script generation
//! - [`initimage`] - init image staging and packing
//! - [`qemu`] - hypervisor command construction and launch
//! - [`pipeline`] - ordered, resumable stage runner
//! - [`preflight`] - host tool checks
//! - [`status`] - artifact status report and cleanup
//! - [`util`] - partial-file helpers

pub mod boot;
pub mod cache;
pub mod config;
pub mod exec;
pub mod initimage;
pub mod kconfig;
pub mod kernel;
pub mod pipeline;
pub mod preflight;
pub mod qemu;
pub mod rootfs;
pub mod squashfs;
pub mod status;
pub mod util;

pub use config::Config;
pub use pipeline::{Pipeline, PipelineReport, Stage, StageOutcome};
