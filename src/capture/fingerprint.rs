//! Content fingerprints and artifact paths
//!
//! Cache identity and file naming are separate concerns: a [`Fingerprint`] is
//! a SHA-256 of the canonical options, while [`PathResolver`] mints a fresh,
//! never-reused file name for every render.

use crate::capture::options::{ImageFormat, NormalizedOptions};
use crate::error::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Suffix every artifact name carries before its extension
pub const ARTIFACT_SUFFIX: &str = "printed-map";

/// Content key of a set of normalized options
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint the canonical JSON form of the options
    pub fn of(options: &NormalizedOptions) -> Result<Self> {
        let canonical = serde_json::to_vec(options)?;
        let digest = Sha256::digest(&canonical);
        Ok(Self(hex::encode(digest)))
    }

    /// Hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Mints artifact paths inside a storage directory
#[derive(Debug, Clone)]
pub struct PathResolver {
    storage: PathBuf,
}

impl PathResolver {
    /// Create a resolver rooted at `storage`, made absolute against the
    /// current directory when relative
    pub fn new(storage: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage = storage.as_ref();
        let storage = if storage.is_absolute() {
            storage.to_path_buf()
        } else {
            std::env::current_dir()?.join(storage)
        };
        Ok(Self { storage })
    }

    /// Storage directory
    pub fn storage(&self) -> &Path {
        &self.storage
    }

    /// A fresh artifact path: `<storage>/<uuid>-<timestamp>-printed-map.<ext>`
    pub fn resolve(&self, format: ImageFormat) -> PathBuf {
        let token = Uuid::new_v4();
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        self.storage.join(format!(
            "{}-{}-{}.{}",
            token,
            timestamp,
            ARTIFACT_SUFFIX,
            format.extension()
        ))
    }
}
