//! Init image builder.
//!
//! The init image is the kernel's root device. It holds just enough of the
//! base archive to run a busybox shell, the empty mount points stage 1 needs,
//! and both boot-stage scripts. The tree is staged in a temporary directory,
//! written to `init.tar`, and packed with `sqfstar`.

use crate::boot::{self, BootParams};
use crate::cache::{ArtifactCache, Probe};
use crate::config::Config;
use crate::exec::ToolRunner;
use crate::pipeline::StageOutcome;
use crate::squashfs;
use crate::util::remove_if_exists;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Members copied from the base archive: busybox, the `sh` link to it, and
/// the musl loader busybox is linked against.
pub const ALLOWED_MEMBERS: &[&str] = &[
    "bin/busybox",
    "bin/sh",
    "lib/ld-musl-x86_64.so.1",
    "lib/libc.musl-x86_64.so.1",
];

/// Existence-gated on the init image itself.
pub fn assemble<P: Probe>(
    config: &Config,
    cache: &ArtifactCache<P>,
    runner: &mut dyn ToolRunner,
) -> Result<StageOutcome> {
    let image = config.init_image();
    if cache.is_present(&image) {
        debug!(path = %image.display(), "init image present");
        return Ok(StageOutcome::Skipped);
    }

    let tar_path = config.init_tar();
    if cache.is_present(&tar_path) {
        warn!(path = %tar_path.display(), "removing stale init tarball");
        remove_if_exists(&tar_path)?;
    }

    info!(path = %image.display(), "assembling init image");
    let staging = tempfile::Builder::new()
        .prefix("init-staging-")
        .tempdir_in(&config.artifacts_dir)
        .with_context(|| {
            format!(
                "Failed to create staging dir in {}",
                config.artifacts_dir.display()
            )
        })?;

    let packed = stage_tree(staging.path(), &config.base_archive_path(), &config.boot)
        .and_then(|()| write_tar(staging.path(), &tar_path))
        .and_then(|()| {
            let mut tar = File::open(&tar_path)
                .with_context(|| format!("Failed to open {}", tar_path.display()))?;
            squashfs::pack_tar_stream(runner, &mut tar, &image)
        });

    remove_if_exists(&tar_path)?;
    staging
        .close()
        .context("Failed to remove init staging directory")?;
    packed?;
    Ok(StageOutcome::Ran)
}

/// Populate `root` with the allow-listed binaries, mount points and scripts.
pub fn stage_tree(root: &Path, base_archive: &Path, params: &BootParams) -> Result<()> {
    for dir in params.init_image_dirs() {
        let path = root.join(&dir);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }

    extract_members(base_archive, root, ALLOWED_MEMBERS)?;

    let stage1 = boot::render_stage1(params).context("Invalid stage 1 mount order")?;
    write_script(root, &params.stage1_path, &stage1)?;
    write_script(root, &params.stage2_path, &boot::render_stage2(params))?;
    Ok(())
}

/// Unpack only `members` from a gzipped tarball into `dest`.
///
/// Symlinks are kept as symlinks. Any member not found is an error.
pub fn extract_members(archive: &Path, dest: &Path, members: &[&str]) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut wanted: BTreeSet<PathBuf> = members.iter().map(PathBuf::from).collect();
    let entries = tar
        .entries()
        .with_context(|| format!("Failed to read {}", archive.display()))?;
    for entry in entries {
        if wanted.is_empty() {
            break;
        }
        let mut entry = entry
            .with_context(|| format!("Corrupt entry in {}", archive.display()))?;
        let name = normalize(&entry.path()?);
        if wanted.remove(&name) {
            entry
                .unpack_in(dest)
                .with_context(|| format!("Failed to extract {}", name.display()))?;
            debug!(member = %name.display(), "copied into init image");
        }
    }

    if !wanted.is_empty() {
        let missing: Vec<_> = wanted.iter().map(|p| p.display().to_string()).collect();
        bail!(
            "{} does not contain {}",
            archive.display(),
            missing.join(", ")
        );
    }
    Ok(())
}

/// `./bin/sh` and `bin/sh` name the same member.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn write_script(root: &Path, path_in_image: &str, content: &str) -> Result<()> {
    let path = root.join(path_in_image.trim_start_matches('/'));
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Write the staged tree as a tar stream owned by root.
pub fn write_tar(root: &Path, tar_path: &Path) -> Result<()> {
    let file = File::create(tar_path)
        .with_context(|| format!("Failed to create {}", tar_path.display()))?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Deterministic);
    builder
        .append_dir_all(".", root)
        .with_context(|| format!("Failed to archive {}", root.display()))?;
    builder.into_inner()?.flush()?;
    Ok(())
}
