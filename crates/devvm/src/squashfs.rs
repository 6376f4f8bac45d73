//! Squashfs packing via `sqfstar`.
//!
//! `sqfstar` reads a tar stream on stdin and writes a squashfs image, so
//! neither image needs an extracted tree on disk. Output goes to a `.part`
//! file that is renamed into place only on success: the image path existing
//! is the stage's completion marker.

use crate::exec::{Invocation, ToolRunner};
use crate::util::{part_path, remove_if_exists};
use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

pub const SQFSTAR: &str = "sqfstar";

/// Compression used for both images; the kernel needs `SQUASHFS_ZSTD`.
pub const COMPRESSION: &str = "zstd";

/// The `sqfstar` command writing to `output`.
pub fn invocation(output: &Path) -> Invocation {
    Invocation::new(SQFSTAR)
        .args(["-comp", COMPRESSION, "-quiet", "-no-progress"])
        .arg(output)
}

/// Pack the tar stream `input` into the squashfs image at `output`.
pub fn pack_tar_stream(
    runner: &mut dyn ToolRunner,
    input: &mut dyn Read,
    output: &Path,
) -> Result<()> {
    let part = part_path(output);
    remove_if_exists(&part)?;

    let packed = runner
        .run_with_input(&invocation(&part), input)
        .with_context(|| format!("Failed to pack {}", output.display()));
    if let Err(err) = packed {
        remove_if_exists(&part)?;
        return Err(err);
    }

    std::fs::rename(&part, output)
        .with_context(|| format!("Failed to move {} into place", part.display()))?;
    Ok(())
}
