//! Fake tool runner and fixtures for pipeline integration tests.
//!
//! `FakeRunner` records every invocation and simulates the side effects the
//! pipeline relies on, so whole runs execute against a temporary directory
//! without git, make, curl, sqfstar or QEMU installed.

#![allow(dead_code)]

use devvm::cache::sha256_hex;
use devvm::config::{Config, Overrides, ROOTFS_SHA256_ENV, ROOTFS_URL_ENV};
use devvm::exec::{Invocation, ToolError, ToolRunner};
use devvm::kconfig::REQUIRED_GROUPS;
use devvm::{Pipeline, PipelineReport};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const ROOTFS_URL: &str = "https://mirror.test/alpine-minirootfs.tar.gz";

/// One recorded tool call.
#[derive(Clone, Debug)]
pub struct Call {
    pub invocation: Invocation,
    /// Bytes streamed to stdin, if any.
    pub input: Option<Vec<u8>>,
}

impl Call {
    pub fn program(&self) -> String {
        self.invocation.program()
    }

    pub fn args(&self) -> Vec<String> {
        self.invocation.args_lossy()
    }
}

/// Records invocations and imitates each tool's effect on disk.
#[derive(Debug, Default)]
pub struct FakeRunner {
    pub calls: Vec<Call>,
    /// Served by `curl`.
    pub download: Vec<u8>,
    /// Served for `.sha256` URLs; defaults to the digest of `download`.
    pub published_digest: Option<String>,
    /// Returned by QEMU.
    pub qemu_code: Option<i32>,
    /// Program that exits 1 without side effects.
    pub failing: Option<String>,
}

impl FakeRunner {
    pub fn new(download: Vec<u8>) -> Self {
        Self {
            download,
            qemu_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failing(mut self, program: &str) -> Self {
        self.failing = Some(program.to_string());
        self
    }

    /// Compact call log: `make` calls include their target.
    pub fn summary(&self) -> Vec<String> {
        self.calls
            .iter()
            .map(|call| {
                let program = call.program();
                match (program.as_str(), call.args().last()) {
                    ("make", Some(target)) => format!("make {target}"),
                    _ => program,
                }
            })
            .collect()
    }

    pub fn calls_to(&self, program: &str) -> Vec<&Call> {
        self.calls.iter().filter(|c| c.program() == program).collect()
    }

    fn record(
        &mut self,
        invocation: &Invocation,
        input: Option<Vec<u8>>,
    ) -> Result<Option<i32>, ToolError> {
        let program = invocation.program();
        let failed = self.failing.as_deref() == Some(program.as_str());
        if !failed {
            self.simulate(invocation).map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;
        }
        self.calls.push(Call {
            invocation: invocation.clone(),
            input,
        });

        if failed {
            Ok(Some(1))
        } else if program == devvm::qemu::QEMU_BINARY {
            Ok(self.qemu_code)
        } else {
            Ok(Some(0))
        }
    }

    fn simulate(&self, invocation: &Invocation) -> io::Result<()> {
        let args = invocation.args_lossy();
        let cwd = invocation.cwd().map(Path::to_path_buf).unwrap_or_default();
        match invocation.program().as_str() {
            "git" => {
                if let Some(dest) = args.last() {
                    std::fs::create_dir_all(dest)?;
                }
            }
            "make" => match args.last().map(String::as_str) {
                Some("defconfig") => std::fs::write(cwd.join(".config"), "CONFIG_64BIT=y\n")?,
                Some("bzImage") => {
                    let image = cwd.join(devvm::config::KERNEL_IMAGE);
                    if let Some(parent) = image.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(image, b"bzImage")?;
                }
                _ => {}
            },
            "bash" => {
                // bash scripts/config --file .config --enable X --disable Y ...
                let file = cwd.join(&args[2]);
                let mut out = std::fs::OpenOptions::new().append(true).open(file)?;
                for pair in args[3..].chunks(2) {
                    match pair {
                        [flag, option] if flag == "--enable" => writeln!(out, "CONFIG_{option}=y")?,
                        [flag, option] if flag == "--disable" => {
                            writeln!(out, "# CONFIG_{option} is not set")?;
                        }
                        _ => {}
                    }
                }
            }
            "curl" => {
                let Some(pos) = args.iter().position(|a| a == "-o") else {
                    return Ok(());
                };
                let url = args.last().map(String::as_str).unwrap_or_default();
                if url.ends_with(".sha256") {
                    let digest = self
                        .published_digest
                        .clone()
                        .unwrap_or_else(|| sha256_hex(&self.download));
                    std::fs::write(
                        &args[pos + 1],
                        format!("{digest}  alpine-minirootfs-x86_64.tar.gz\n"),
                    )?;
                } else {
                    std::fs::write(&args[pos + 1], &self.download)?;
                }
            }
            "sqfstar" => {
                if let Some(dest) = args.last() {
                    std::fs::write(dest, b"hsqs")?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ToolRunner for FakeRunner {
    fn status(&mut self, invocation: &Invocation) -> Result<Option<i32>, ToolError> {
        self.record(invocation, None)
    }

    fn status_with_input(
        &mut self,
        invocation: &Invocation,
        input: &mut dyn Read,
    ) -> Result<Option<i32>, ToolError> {
        let mut buf = Vec::new();
        input
            .read_to_end(&mut buf)
            .map_err(|source| ToolError::Input {
                program: invocation.program(),
                source,
            })?;
        self.record(invocation, Some(buf))
    }
}

/// A gzipped tarball shaped like the Alpine minirootfs.
pub fn base_archive() -> Vec<u8> {
    let mut tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));

    for (name, data) in [
        ("./bin/busybox", &b"\x7fELF busybox"[..]),
        ("./lib/ld-musl-x86_64.so.1", &b"\x7fELF musl"[..]),
        ("./etc/alpine-release", &b"3.20.3\n"[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        tar.append_data(&mut header, name, data).unwrap();
    }
    for (name, target) in [
        ("./bin/sh", "/bin/busybox"),
        ("./lib/libc.musl-x86_64.so.1", "ld-musl-x86_64.so.1"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        tar.append_link(&mut header, name, target).unwrap();
    }

    tar.into_inner().unwrap().finish().unwrap()
}

/// A `.config` enabling every required option except `omit`.
pub fn config_text_without(omit: &[&str]) -> String {
    REQUIRED_GROUPS
        .iter()
        .flat_map(|g| g.options)
        .filter(|o| !omit.contains(o))
        .map(|o| format!("CONFIG_{o}=y\n"))
        .collect()
}

/// A temporary kernel workspace, artifacts directory and host share.
pub struct TestEnv {
    pub tmp: TempDir,
    pub config: Config,
    pub archive: Vec<u8>,
    /// SHA-256 of `archive`.
    pub digest: String,
}

impl TestEnv {
    /// Base archive digest pinned through the environment.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// No pinned digest: the published checksum file is fetched.
    pub fn unpinned() -> Self {
        Self::build(false)
    }

    fn build(pin_digest: bool) -> Self {
        let tmp = TempDir::new().unwrap();
        let share = tmp.path().join("share");
        std::fs::create_dir(&share).unwrap();

        let archive = base_archive();
        let digest = sha256_hex(&archive);
        let pinned = pin_digest.then(|| digest.clone());
        let overrides = Overrides {
            kernel_dir: Some(tmp.path().join("linux").display().to_string()),
            artifacts_dir: Some(tmp.path().join("art").display().to_string()),
            hypervisor_args: vec!["-s".to_string()],
        };
        let config = Config::resolve(
            overrides,
            move |key| match key {
                ROOTFS_URL_ENV => Some(ROOTFS_URL.to_string()),
                ROOTFS_SHA256_ENV => pinned.clone(),
                _ => None,
            },
            &share,
        )
        .unwrap();

        Self {
            tmp,
            config,
            archive,
            digest,
        }
    }

    pub fn runner(&self) -> FakeRunner {
        FakeRunner::new(self.archive.clone())
    }

    pub fn run(&self, runner: &mut FakeRunner) -> anyhow::Result<PipelineReport> {
        Pipeline::new(&self.config, runner).run()
    }

    pub fn run_without_launch(&self, runner: &mut FakeRunner) -> anyhow::Result<PipelineReport> {
        Pipeline::new(&self.config, runner).without_launch().run()
    }

    /// Write a kernel workspace with the given `.config`, skipping clone and
    /// configure.
    pub fn seed_workspace(&self, config_text: &str) {
        std::fs::create_dir_all(&self.config.kernel_dir).unwrap();
        std::fs::write(self.config.config_file(), config_text).unwrap();
    }

    /// Entries left in the artifacts directory.
    pub fn artifact_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.config.artifacts_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }
}

/// Entry names of an uncompressed tar stream, without leading `./`.
pub fn tar_entry_names(data: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(data);
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            let path = e.path().unwrap().display().to_string();
            path.trim_start_matches("./").trim_end_matches('/').to_string()
        })
        .collect()
}

/// Contents of one file inside an uncompressed tar stream.
pub fn tar_file(data: &[u8], name: &str) -> Option<String> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().display().to_string();
        if path.trim_start_matches("./") == name {
            let mut text = String::new();
            entry.read_to_string(&mut text).unwrap();
            return Some(text);
        }
    }
    None
}
