//! Renderer process
//!
//! This module is what the `shotcache-render` binary runs: it decodes the
//! options payload, drives a headless Chromium page through the render state
//! machine, and reports back through its exit code and the output file.

pub mod machine;
pub mod page_ops;
pub mod session;

pub use machine::{run, RenderExit, RenderStage, ShotPlan, StageError, RENDER_PROTOCOL};
pub use page_ops::{PageOp, DEFAULT_STYLES};
pub use session::RenderSession;
