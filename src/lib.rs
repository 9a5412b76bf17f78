//! shotcache - cached web page screenshots
//!
//! This crate renders screenshots of web pages by driving a headless-browser
//! subprocess, caches the artifacts on disk keyed by the request's content,
//! and optionally compresses them.
//!
//! # Architecture
//!
//! ```text
//! CaptureRequest ──▶ normalize ──▶ Fingerprint ──▶ CacheGate ──(hit)──▶ RenderOutcome
//!                                                      │
//!                                                   (miss)
//!                                                      ▼
//!                        Supervisor ──spawn──▶ shotcache-render (Chromium via CDP)
//!                            │                        │
//!                            ▼                        ▼
//!                        exit code              artifact on disk
//!                            │
//!                            ▼
//!                     compress (optional) ──▶ RenderOutcome
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use shotcache::{CaptureConfig, CaptureRequest, Capturer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CaptureConfig::builder()
//!         .storage("/var/lib/shotcache")
//!         .cache(true)
//!         .build();
//!     let capturer = Capturer::new(config).await?;
//!
//!     let outcome = capturer
//!         .capture(&CaptureRequest::new("https://example.com").format("jpeg"))
//!         .await?;
//!
//!     println!("{} (status {})", outcome.path.display(), outcome.status.code());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod capture;
pub mod config;
pub mod error;
pub mod render;

// Re-exports for convenience
pub use capture::{capture, CaptureRequest, Capturer, RenderOutcome, RenderStatus};
pub use config::CaptureConfig;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
