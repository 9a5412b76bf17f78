//! Cache gate and content index
//!
//! The gate is a boolean decision, not a cache: it never evicts, expires, or
//! bounds anything. The index maps content fingerprints to the artifact paths
//! that earlier renders produced.

use crate::capture::fingerprint::Fingerprint;
use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Name of the index file inside the storage directory
pub const INDEX_FILE: &str = "shotcache-index.json";

/// Outcome of the cache gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    /// Reuse an existing artifact without rendering
    Reuse(PathBuf),
    /// Render a new artifact
    Regenerate,
}

/// Default existence capability backed by the filesystem
pub async fn file_exists(path: PathBuf) -> bool {
    tokio::fs::try_exists(&path).await.unwrap_or(false)
}

/// Reuse-or-regenerate decision point
pub struct CacheGate;

impl CacheGate {
    /// Decide whether `candidate` can be reused
    ///
    /// `force` or a disabled cache always regenerates without touching the
    /// filesystem. Otherwise a candidate that `exists` is reused.
    pub async fn decide<F, Fut>(
        force: bool,
        cache_enabled: bool,
        candidate: Option<&Path>,
        exists: F,
    ) -> CacheDecision
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = bool>,
    {
        if force || !cache_enabled {
            return CacheDecision::Regenerate;
        }

        match candidate {
            Some(path) if exists(path.to_path_buf()).await => {
                CacheDecision::Reuse(path.to_path_buf())
            }
            _ => CacheDecision::Regenerate,
        }
    }
}

/// Fingerprint to artifact path table, optionally persisted as JSON
pub struct CacheIndex {
    file: Option<PathBuf>,
    entries: RwLock<HashMap<String, PathBuf>>,
}

impl CacheIndex {
    /// An index that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            file: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Load the index stored in `storage`, starting empty when it is missing
    /// or unreadable
    #[instrument]
    pub async fn load(storage: &Path) -> Result<Self> {
        let file = storage.join(INDEX_FILE);

        let entries = match tokio::fs::read(&file).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, PathBuf>>(&bytes) {
                Ok(entries) => {
                    debug!("Loaded {} index entries", entries.len());
                    entries
                }
                Err(e) => {
                    warn!("Ignoring corrupt cache index {}: {}", file.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            file: Some(file),
            entries: RwLock::new(entries),
        })
    }

    /// Path previously recorded for a fingerprint
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        self.entries.read().await.get(fingerprint.as_str()).cloned()
    }

    /// Record a path and persist the index
    pub async fn insert(&self, fingerprint: &Fingerprint, path: PathBuf) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(fingerprint.as_str().to_string(), path);

        if let Some(file) = &self.file {
            let json = serde_json::to_vec_pretty(&*entries)?;
            let tmp = file.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, file).await?;
        }

        Ok(())
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the index is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_force_regenerates_without_existence_check() {
        let checks = AtomicUsize::new(0);
        let decision = CacheGate::decide(true, true, Some(Path::new("/a.png")), |_| {
            checks.fetch_add(1, Ordering::SeqCst);
            async { true }
        })
        .await;

        assert_eq!(decision, CacheDecision::Regenerate);
        assert_eq!(checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_regenerates() {
        let decision =
            CacheGate::decide(false, false, Some(Path::new("/a.png")), |_| async { true }).await;
        assert_eq!(decision, CacheDecision::Regenerate);
    }

    #[tokio::test]
    async fn test_existing_candidate_is_reused() {
        let decision =
            CacheGate::decide(false, true, Some(Path::new("/a.png")), |_| async { true }).await;
        assert_eq!(decision, CacheDecision::Reuse(PathBuf::from("/a.png")));
    }

    #[tokio::test]
    async fn test_missing_candidate_regenerates() {
        let decision =
            CacheGate::decide(false, true, Some(Path::new("/a.png")), |_| async { false }).await;
        assert_eq!(decision, CacheDecision::Regenerate);

        let decision = CacheGate::decide(false, true, None, |_| async { true }).await;
        assert_eq!(decision, CacheDecision::Regenerate);
    }

    #[tokio::test]
    async fn test_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        assert!(!file_exists(path.clone()).await);
        std::fs::write(&path, b"png").unwrap();
        assert!(file_exists(path).await);
    }

    #[tokio::test]
    async fn test_index_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let fingerprint = Fingerprint::from("abc123".to_string());

        let index = CacheIndex::load(dir.path()).await.unwrap();
        assert!(index.is_empty().await);
        index
            .insert(&fingerprint, dir.path().join("a.png"))
            .await
            .unwrap();

        let reloaded = CacheIndex::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        assert_eq!(
            reloaded.get(&fingerprint).await,
            Some(dir.path().join("a.png"))
        );
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"{not json").unwrap();

        let index = CacheIndex::load(dir.path()).await.unwrap();
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_memory_index() {
        let index = CacheIndex::in_memory();
        let fingerprint = Fingerprint::from("f".to_string());
        assert!(index.get(&fingerprint).await.is_none());
        index.insert(&fingerprint, PathBuf::from("/x.png")).await.unwrap();
        assert_eq!(index.get(&fingerprint).await, Some(PathBuf::from("/x.png")));
    }
}
