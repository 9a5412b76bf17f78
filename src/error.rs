//! Error types for shotcache
//!
//! This module provides the error hierarchy shared by the orchestrator and the
//! renderer process. Failures that happen below the orchestrator boundary are
//! reported through [`crate::capture::RenderOutcome`] instead; only problems
//! that prevent a capture from starting surface as [`Error`].

use thiserror::Error;

/// The main error type for shotcache operations
#[derive(Error, Debug)]
pub enum Error {
    /// The capture request was rejected before anything was spawned
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration loading and resolution errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read {path}: {message}")]
    Read {
        /// Path of the configuration file
        path: String,
        /// Underlying error message
        message: String,
    },

    /// Configuration file was not valid JSON for the expected shape
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The resolved render command has no program to run
    #[error("Render command is empty")]
    EmptyCommand,
}

/// Errors raised inside the renderer process
#[derive(Error, Debug)]
pub enum RenderError {
    /// The options payload could not be decoded
    #[error("Invalid options payload: {0}")]
    InvalidPayload(String),

    /// The renderer was asked to speak a protocol it does not know
    #[error("Unsupported render protocol: {0}")]
    UnsupportedProtocol(String),

    /// Failed to launch the browser
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    /// Failed to apply page configuration
    #[error("Failed to configure page: {0}")]
    ConfigureFailed(String),

    /// Navigation to the target URL failed
    #[error("Failed to open {url}: {message}")]
    OpenFailed {
        /// URL that was being opened
        url: String,
        /// Error message
        message: String,
    },

    /// A named page operation failed
    #[error("Page operation {op} failed: {message}")]
    PageOpFailed {
        /// Operation name
        op: &'static str,
        /// Error message
        message: String,
    },

    /// Screenshot capture failed
    #[error("Screenshot capture failed: {0}")]
    ScreenshotFailed(String),

    /// The renderer was told to stop before finishing
    #[error("Terminated by {0}")]
    Terminated(&'static str),
}

/// Post-processing errors; logged, never escalated
#[derive(Error, Debug)]
pub enum CompressError {
    /// Reading or writing the artifact failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The artifact could not be decoded or re-encoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// The recompressed file could not replace the original
    #[error("Failed to replace artifact: {0}")]
    Persist(#[from] tempfile::PersistError),

    /// The JPEG could not be re-encoded losslessly
    #[error("JPEG error: {0}")]
    Jpeg(#[from] JpegError),

    /// The optimized file did not decode to the same pixels
    #[error("Optimized artifact differs from the original")]
    Mismatch,

    /// The blocking compression task panicked or was cancelled
    #[error("Compression task failed: {0}")]
    Task(String),
}

/// Lossless JPEG re-encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JpegError {
    /// A valid JPEG this optimizer does not handle
    #[error("unsupported JPEG: {0}")]
    Unsupported(&'static str),

    /// The file is not a well-formed JPEG
    #[error("corrupt JPEG: {0}")]
    Corrupt(&'static str),
}

/// Result type alias for shotcache operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a malformed-request error from a string
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedRequest(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::LaunchFailed("no chrome".to_string());
        assert!(err.to_string().contains("Failed to launch browser"));
        assert!(err.to_string().contains("no chrome"));
    }

    #[test]
    fn test_terminated() {
        assert_eq!(
            RenderError::Terminated("SIGTERM").to_string(),
            "Terminated by SIGTERM"
        );
    }

    #[test]
    fn test_malformed_request() {
        let err = Error::malformed("URL cannot be empty");
        assert_eq!(err.to_string(), "Malformed request: URL cannot be empty");
    }

    #[test]
    fn test_config_error() {
        let err: Error = ConfigError::EmptyCommand.into();
        assert!(err.to_string().contains("Render command is empty"));
    }

    #[test]
    fn test_open_failed() {
        let err = RenderError::OpenFailed {
            url: "http://example.com".to_string(),
            message: "net::ERR_NAME_NOT_RESOLVED".to_string(),
        };
        assert!(err.to_string().contains("http://example.com"));
        assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
    }

    #[test]
    fn test_page_op_failed() {
        let err = RenderError::PageOpFailed {
            op: "inject-style",
            message: "document.head is null".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Page operation inject-style failed: document.head is null"
        );
    }
}
