//! Artifact cache gates.
//!
//! Every expensive pipeline step asks the cache whether its output is already
//! present (existence-gated) or present with the expected content
//! (hash-gated). The cache only decides; it never creates or deletes files.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

/// Filesystem facts the cache bases its decisions on.
pub trait Probe {
    /// Whether anything exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Lowercase hex SHA-256 of the file at `path`.
    fn sha256(&self, path: &Path) -> io::Result<String>;
}

/// [`Probe`] backed by the real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsProbe;

impl Probe for FsProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn sha256(&self, path: &Path) -> io::Result<String> {
        file_sha256(path)
    }
}

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `s` looks like a hex SHA-256 digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Decides whether a pipeline step can be skipped.
#[derive(Clone, Debug, Default)]
pub struct ArtifactCache<P: Probe = FsProbe> {
    probe: P,
}

impl ArtifactCache<FsProbe> {
    /// Cache backed by the real filesystem.
    pub fn system() -> Self {
        Self::new(FsProbe)
    }
}

impl<P: Probe> ArtifactCache<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Existence-gated: valid iff `path` exists.
    pub fn is_present(&self, path: &Path) -> bool {
        self.probe.exists(path)
    }

    /// Hash-gated: valid iff `path` exists and hashes to `expected_sha256`.
    ///
    /// Unreadable files and mismatches are treated as absent.
    pub fn is_valid(&self, path: &Path, expected_sha256: &str) -> bool {
        if !self.probe.exists(path) {
            return false;
        }
        match self.probe.sha256(path) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected_sha256) => true,
            Ok(actual) => {
                warn!(
                    path = %path.display(),
                    expected = expected_sha256,
                    actual = %actual,
                    "cached file does not match its pinned hash"
                );
                false
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "cannot hash cached file");
                false
            }
        }
    }
}
