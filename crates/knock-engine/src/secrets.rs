//! Pre-shared secret loading.
//!
//! Secrets are base32 text files (RFC 4648 alphabet, no padding, optional
//! surrounding whitespace) collected from a directory at startup. Any file
//! that fails to decode aborts startup — a half-loaded secret directory
//! silently shrinks the set of clients that can authenticate.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use data_encoding::BASE32_NOPAD;

/// Minimum decoded secret length accepted from a secret file.
pub const MIN_SECRET_LEN: usize = 16;

/// A decoded shared secret. Immutable for the process lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        ensure!(
            bytes.len() >= MIN_SECRET_LEN,
            "secret too short: {} bytes decoded, need at least {}",
            bytes.len(),
            MIN_SECRET_LEN
        );
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Key material stays out of logs and panic messages.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// Read and decode a single secret file.
pub fn load_secret_file(path: &Path) -> Result<Secret> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read secret file: {}", path.display()))?;
    let bytes = BASE32_NOPAD
        .decode(text.trim().as_bytes())
        .with_context(|| format!("failed to base32 decode secret file: {}", path.display()))?;
    Secret::from_bytes(bytes)
        .with_context(|| format!("rejected secret file: {}", path.display()))
}

/// Load every regular file in `dir` as a secret. Subdirectories are skipped;
/// any unreadable or undecodable file is fatal. Files are processed in name
/// order so secret ids are stable across restarts.
pub fn load_secrets(dir: &Path) -> Result<Vec<Secret>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read secret directory: {}", dir.display()))?;

    let mut paths: Vec<_> = entries
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list secret directory: {}", dir.display()))?
        .into_iter()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    paths.sort();

    let mut secrets = Vec::with_capacity(paths.len());
    for path in &paths {
        secrets.push(load_secret_file(path)?);
    }
    ensure!(
        !secrets.is_empty(),
        "no secret files found in '{}' — generate one with `knockd generate secret`",
        dir.display()
    );
    Ok(secrets)
}
