//! Content fingerprinting for uploaded files.
//!
//! A fingerprint is the lowercase hex SHA-256 of the file's bytes. Identical
//! bytes always produce the same fingerprint, which makes it the key of the
//! deduplication index.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Read buffer size used when hashing files.
const CHUNK_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest.
const HEX_LEN: usize = 64;

/// Characters kept by [`Fingerprint::short`].
const SHORT_LEN: usize = 16;

/// Errors that can occur while computing or parsing fingerprints.
#[derive(Debug, Error)]
pub enum FingerprintError {
    /// Reading the file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The string is not a 64-character hex digest.
    #[error("invalid fingerprint: {0}")]
    Invalid(String),
}

/// Content hash used as the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed key without validation.
    ///
    /// Producers that hash content elsewhere (for example a web layer that
    /// hashed while streaming the upload) pass their key through here.
    pub fn new_unchecked(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Full hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(SHORT_LEN)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(FingerprintError::Invalid(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fingerprint an in-memory buffer.
pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    Fingerprint(hex(&Sha256::digest(bytes)))
}

/// Fingerprint a file on disk, streaming it in chunks.
pub async fn fingerprint_file(path: &Path) -> Result<Fingerprint, FingerprintError> {
    let io_err = |source| FingerprintError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let fingerprint = Fingerprint(hex(&hasher.finalize()));
    tracing::debug!("Computed fingerprint for {}: {}", path.display(), fingerprint.short());
    Ok(fingerprint)
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
