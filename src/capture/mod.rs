//! Capture pipeline
//!
//! This module turns capture requests into cached screenshot artifacts by
//! driving the renderer subprocess.

pub mod cache;
pub mod compress;
pub mod fingerprint;
pub mod jpeg;
pub mod options;
pub mod pipeline;
pub mod supervisor;

pub use cache::{CacheDecision, CacheGate, CacheIndex};
pub use compress::Compression;
pub use fingerprint::{Fingerprint, PathResolver};
pub use options::{
    normalize, CaptureRequest, ClipRect, ImageFormat, NormalizedOptions, PageSettings, Region,
};
pub use pipeline::{capture, Capturer, RenderOutcome, RenderStatus};
pub use supervisor::{ProcessExit, Supervisor};
