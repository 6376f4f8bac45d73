//! Base root filesystem: download and squashfs packing.

use crate::cache::{file_sha256, is_sha256_hex, ArtifactCache, Probe};
use crate::config::Config;
use crate::exec::{Invocation, ToolRunner};
use crate::pipeline::StageOutcome;
use crate::squashfs;
use crate::util::{part_path, remove_if_exists};
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A freshly downloaded file did not match its expected digest.
#[derive(Debug, Error)]
#[error("downloaded {url} has sha256 {actual}, expected {expected}")]
pub struct IntegrityError {
    pub url: String,
    pub expected: String,
    pub actual: String,
}

/// `curl` fetching `url` into `dest`; fails on HTTP errors, follows redirects.
pub fn download_invocation(url: &str, dest: &Path) -> Invocation {
    Invocation::new("curl")
        .args(["-L", "-f", "-S", "-#", "-o"])
        .arg(dest)
        .arg(url)
}

/// Download `url` into the `.part` sibling of `dest` and return that path.
///
/// A failed transfer leaves nothing behind.
fn download_part(runner: &mut dyn ToolRunner, url: &str, dest: &Path) -> Result<PathBuf> {
    if let Some(dir) = dest.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let part = part_path(dest);
    remove_if_exists(&part)?;
    if let Err(err) = runner.run(&download_invocation(url, &part)) {
        remove_if_exists(&part)?;
        return Err(err.into());
    }
    Ok(part)
}

/// Digest from the first field of a `sha256sum`-style line.
pub fn parse_checksum(text: &str) -> Option<String> {
    let digest = text.split_whitespace().next()?;
    is_sha256_hex(digest).then(|| digest.to_ascii_lowercase())
}

/// Digest the base archive must hash to.
///
/// A pinned digest is used as is. Otherwise the checksum file published next
/// to the archive is downloaded once and kept beside it.
pub fn expected_digest<P: Probe>(
    config: &Config,
    cache: &ArtifactCache<P>,
    runner: &mut dyn ToolRunner,
) -> Result<String> {
    if let Some(pinned) = &config.base_archive.sha256 {
        return Ok(pinned.clone());
    }

    let path = config.base_archive_checksum_path();
    if !cache.is_present(&path) {
        let url = config.base_archive.checksum_url();
        info!(url = %url, "downloading published checksum");
        let part = download_part(runner, &url, &path)
            .context("Failed to download base archive checksum")?;
        let text = std::fs::read_to_string(&part)
            .with_context(|| format!("Failed to read {}", part.display()))?;
        if parse_checksum(&text).is_none() {
            remove_if_exists(&part)?;
            bail!("{url} does not start with a sha256 digest");
        }
        std::fs::rename(&part, &path)
            .with_context(|| format!("Failed to move {} into place", part.display()))?;
    }
    recorded_checksum(&path)
}

/// Digest stored in a local checksum file.
pub fn recorded_checksum(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_checksum(&text).with_context(|| {
        format!(
            "{} does not start with a sha256 digest; delete it to fetch it again",
            path.display()
        )
    })
}

/// Hash-gated fetch of the base archive.
pub fn fetch_base_archive<P: Probe>(
    config: &Config,
    cache: &ArtifactCache<P>,
    runner: &mut dyn ToolRunner,
) -> Result<StageOutcome> {
    let artifact = &config.base_archive;
    let dest = config.base_archive_path();
    let expected = expected_digest(config, cache, runner)?;

    if cache.is_valid(&dest, &expected) {
        debug!(path = %dest.display(), "base archive verified");
        return Ok(StageOutcome::Skipped);
    }
    if cache.is_present(&dest) {
        warn!(path = %dest.display(), "discarding base archive with wrong hash");
    }

    info!(url = %artifact.url, "downloading base archive");
    let part = download_part(runner, &artifact.url, &dest)
        .context("Failed to download base archive")?;

    let actual = file_sha256(&part)
        .with_context(|| format!("Failed to hash {}", part.display()))?;
    if !actual.eq_ignore_ascii_case(&expected) {
        remove_if_exists(&part)?;
        return Err(IntegrityError {
            url: artifact.url.clone(),
            expected,
            actual,
        }
        .into());
    }

    std::fs::rename(&part, &dest)
        .with_context(|| format!("Failed to move {} into place", part.display()))?;
    info!(path = %dest.display(), "base archive verified");
    Ok(StageOutcome::Ran)
}

/// Existence-gated: stream the gunzipped archive straight into `sqfstar`.
pub fn package_base_image<P: Probe>(
    config: &Config,
    cache: &ArtifactCache<P>,
    runner: &mut dyn ToolRunner,
) -> Result<StageOutcome> {
    let image = config.base_image();
    if cache.is_present(&image) {
        debug!(path = %image.display(), "base image present");
        return Ok(StageOutcome::Skipped);
    }

    let archive = config.base_archive_path();
    let file = File::open(&archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar_stream = GzDecoder::new(BufReader::new(file));

    info!(path = %image.display(), "packing base image");
    squashfs::pack_tar_stream(runner, &mut tar_stream, &image)?;
    Ok(StageOutcome::Ran)
}
