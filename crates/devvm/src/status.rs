//! Artifact status report and cleanup.

use crate::cache::{ArtifactCache, Probe};
use crate::config::Config;
use crate::rootfs;
use crate::util::{part_path, remove_if_exists};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactState {
    Present,
    Missing,
    /// Present but does not hash to the pinned digest.
    HashMismatch,
    /// Intermediate left behind by an interrupted run.
    Stale,
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactStatus {
    pub name: &'static str,
    pub path: PathBuf,
    pub state: ArtifactState,
    /// RFC 3339 modification time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

enum Gate {
    Exists,
    Hash(String),
    Transient,
}

fn artifacts(config: &Config) -> Vec<(&'static str, PathBuf, Gate)> {
    let mut list = vec![
        ("kernel-workspace", config.kernel_dir.clone(), Gate::Exists),
        ("kernel-config", config.config_file(), Gate::Exists),
        ("kernel-image", config.kernel_image(), Gate::Exists),
    ];
    // Without a pinned digest the archive can only be checked once the
    // published checksum has been fetched. Status never downloads.
    let checksum = config.base_archive_checksum_path();
    let expected = match &config.base_archive.sha256 {
        Some(pinned) => Some(pinned.clone()),
        None => rootfs::recorded_checksum(&checksum).ok(),
    };
    if config.base_archive.sha256.is_none() {
        list.push(("base-checksum", checksum, Gate::Exists));
    }
    list.push((
        "base-archive",
        config.base_archive_path(),
        expected.map_or(Gate::Exists, Gate::Hash),
    ));
    list.extend([
        ("base-image", config.base_image(), Gate::Exists),
        ("init-tar", config.init_tar(), Gate::Transient),
        ("init-image", config.init_image(), Gate::Exists),
    ]);
    list
}

/// State of every artifact the pipeline produces.
pub fn collect<P: Probe>(config: &Config, cache: &ArtifactCache<P>) -> Vec<ArtifactStatus> {
    artifacts(config)
        .into_iter()
        .map(|(name, path, gate)| {
            let state = if !cache.is_present(&path) {
                ArtifactState::Missing
            } else {
                match gate {
                    Gate::Hash(expected) if !cache.is_valid(&path, &expected) => {
                        ArtifactState::HashMismatch
                    }
                    Gate::Exists | Gate::Hash(_) => ArtifactState::Present,
                    Gate::Transient => ArtifactState::Stale,
                }
            };
            let meta = std::fs::metadata(&path).ok();
            ArtifactStatus {
                name,
                state,
                modified: meta
                    .as_ref()
                    .and_then(|m| m.modified().ok())
                    .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
                size: meta.filter(std::fs::Metadata::is_file).map(|m| m.len()),
                path,
            }
        })
        .collect()
}

pub fn render_text(statuses: &[ArtifactStatus]) -> String {
    let mut out = String::new();
    for s in statuses {
        let state = match s.state {
            ArtifactState::Present => "present",
            ArtifactState::Missing => "missing",
            ArtifactState::HashMismatch => "hash mismatch",
            ArtifactState::Stale => "stale",
        };
        let _ = writeln!(out, "{:<18} {:<14} {}", s.name, state, s.path.display());
    }
    out
}

pub fn render_json(statuses: &[ArtifactStatus]) -> Result<String> {
    Ok(serde_json::to_string_pretty(statuses)?)
}

/// Remove the generated images and intermediates.
///
/// The kernel workspace and the downloaded archive are kept: they are the
/// expensive ones and are validated on every run anyway.
pub fn clean(config: &Config) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for path in [config.base_image(), config.init_image(), config.init_tar()] {
        for candidate in [part_path(&path), path] {
            if candidate.exists() {
                remove_if_exists(&candidate)?;
                info!(path = %candidate.display(), "removed");
                removed.push(candidate);
            }
        }
    }
    let archive_part = part_path(&config.base_archive_path());
    if archive_part.exists() {
        remove_if_exists(&archive_part)?;
        removed.push(archive_part);
    }
    Ok(removed)
}
