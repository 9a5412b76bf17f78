//! Capture orchestration
//!
//! One capture call runs strictly in order: normalize, fingerprint, cache
//! gate, renderer subprocess, post-processing, outcome. Stages of the same
//! call never overlap; separate calls are independent futures.

use crate::capture::cache::{file_exists, CacheDecision, CacheGate, CacheIndex};
use crate::capture::compress::compress;
use crate::capture::fingerprint::{Fingerprint, PathResolver};
use crate::capture::options::{normalize, CaptureRequest};
use crate::capture::supervisor::{ProcessExit, Supervisor};
use crate::config::CaptureConfig;
use crate::error::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Status code reported for a timed-out renderer
pub const TIMEOUT_STATUS: i32 = 124;

/// Status code reported when the renderer could not be started
pub const SPAWN_FAILURE_STATUS: i32 = 127;

/// Terminal status of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// The artifact exists at the outcome path
    Success,
    /// The renderer exited with a nonzero code
    Exited(i32),
    /// The renderer exceeded the timeout and was killed
    Timeout,
    /// The renderer could not be started
    SpawnFailed,
    /// The renderer exited cleanly but wrote no artifact
    MissingArtifact,
}

impl RenderStatus {
    /// Integer status, 0 on success
    pub fn code(&self) -> i32 {
        match self {
            RenderStatus::Success => 0,
            RenderStatus::Exited(code) => *code,
            RenderStatus::Timeout => TIMEOUT_STATUS,
            RenderStatus::SpawnFailed => SPAWN_FAILURE_STATUS,
            RenderStatus::MissingArtifact => 1,
        }
    }

    /// Whether the capture produced a usable artifact
    pub fn is_success(&self) -> bool {
        matches!(self, RenderStatus::Success)
    }
}

/// Result of one capture call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    /// Artifact path; may not exist when the status is a failure
    pub path: PathBuf,
    /// Terminal status
    pub status: RenderStatus,
    /// Diagnostic detail for failures
    pub error: Option<String>,
    /// Whether the artifact came from the cache gate
    pub cached: bool,
}

impl RenderOutcome {
    fn rendered(path: PathBuf, status: RenderStatus, error: Option<String>) -> Self {
        Self {
            path,
            status,
            error,
            cached: false,
        }
    }

    fn from_cache(path: PathBuf) -> Self {
        Self {
            path,
            status: RenderStatus::Success,
            error: None,
            cached: true,
        }
    }
}

/// Capture orchestrator bound to one configuration
pub struct Capturer {
    config: CaptureConfig,
    resolver: PathResolver,
    supervisor: Supervisor,
    index: CacheIndex,
}

impl Capturer {
    /// Prepare storage, resolve the render command, and load the cache index
    #[instrument(skip(config))]
    pub async fn new(config: CaptureConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage).await?;
        let resolver = PathResolver::new(&config.storage)?;

        let command = config.resolve_command()?;
        let supervisor = Supervisor::new(
            command,
            config.script.clone(),
            Duration::from_millis(config.timeout_ms),
        )?;

        let index = CacheIndex::load(resolver.storage()).await?;
        info!(
            "Capturer ready: storage={}, cache={}, compress={}",
            resolver.storage().display(),
            config.cache,
            config.compress
        );

        Ok(Self {
            config,
            resolver,
            supervisor,
            index,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Get the cache index
    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// Capture a screenshot for `request`
    ///
    /// Returns `Err` only when the request is malformed; every failure after
    /// that point is reported in the outcome.
    #[instrument(skip(self, request), fields(url = %request.url, force = request.force))]
    pub async fn capture(&self, request: &CaptureRequest) -> Result<RenderOutcome> {
        info!("Capture site screenshot: {}", request.url);

        let options = normalize(request, &self.config.options)?;
        let fingerprint = Fingerprint::of(&options)?;

        let candidate = if self.config.cache && !request.force {
            self.index.get(&fingerprint).await
        } else {
            None
        };

        let decision = CacheGate::decide(
            request.force,
            self.config.cache,
            candidate.as_deref(),
            file_exists,
        )
        .await;
        if let CacheDecision::Reuse(path) = decision {
            debug!("Take screenshot from file storage: {}", path.display());
            return Ok(RenderOutcome::from_cache(path));
        }

        let path = self.resolver.resolve(options.format);
        let payload = options.to_payload()?;
        debug!(fingerprint = %fingerprint, "Rendering into {}", path.display());

        let outcome = match self.supervisor.invoke(&payload, &path).await {
            ProcessExit::Exited(0) => {
                if file_exists(path.clone()).await {
                    RenderOutcome::rendered(path, RenderStatus::Success, None)
                } else {
                    RenderOutcome::rendered(
                        path,
                        RenderStatus::MissingArtifact,
                        Some("renderer exited cleanly without writing the artifact".to_string()),
                    )
                }
            }
            ProcessExit::Exited(code) => RenderOutcome::rendered(
                path,
                RenderStatus::Exited(code),
                Some(format!("renderer exited with status {}", code)),
            ),
            ProcessExit::TimedOut { after_ms } => RenderOutcome::rendered(
                path,
                RenderStatus::Timeout,
                Some(format!("renderer timed out after {}ms", after_ms)),
            ),
            ProcessExit::SpawnFailed(message) => {
                RenderOutcome::rendered(path, RenderStatus::SpawnFailed, Some(message))
            }
        };

        if !outcome.status.is_success() {
            warn!(
                "Capture failed with status {}: {}",
                outcome.status.code(),
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            return Ok(outcome);
        }

        if self.config.compress {
            compress(&outcome.path, self.resolver.storage()).await;
        }

        if let Err(e) = self.index.insert(&fingerprint, outcome.path.clone()).await {
            warn!("Failed to record cache entry: {}", e);
        }

        debug!("Process finished work: {}", outcome.path.display());
        Ok(outcome)
    }
}

/// One-shot capture with an explicit configuration
pub async fn capture(request: &CaptureRequest, config: &CaptureConfig) -> Result<RenderOutcome> {
    Capturer::new(config.clone()).await?.capture(request).await
}
