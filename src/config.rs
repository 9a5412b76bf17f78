//! Capture configuration
//!
//! [`CaptureConfig`] is passed explicitly into every orchestrator call. It can
//! be built in code, loaded from a JSON file, and adjusted from `SHOTCACHE_*`
//! environment variables.

use crate::capture::options::PageSettings;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Engine used when none is configured
pub const DEFAULT_ENGINE: &str = "chromium";

/// Command used when neither an explicit command nor a table entry applies
pub const DEFAULT_COMMAND: &str = "shotcache-render";

/// Render protocol the bundled renderer speaks
pub const DEFAULT_SCRIPT: &str = crate::render::RENDER_PROTOCOL;

/// Default subprocess hard limit
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Environment variable overriding the storage directory
pub const STORAGE_ENV_VAR: &str = "SHOTCACHE_STORAGE";

/// Environment variable overriding the subprocess timeout
pub const TIMEOUT_ENV_VAR: &str = "SHOTCACHE_TIMEOUT_MS";

/// Environment variable overriding the render command
pub const COMMAND_ENV_VAR: &str = "SHOTCACHE_COMMAND";

/// Mapping from engine to platform to command line
///
/// Platforms use the names from [`std::env::consts::OS`] (`linux`, `macos`,
/// `windows`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTable(HashMap<String, HashMap<String, String>>);

impl CommandTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command for an engine on a platform
    pub fn insert<E, P, C>(&mut self, engine: E, platform: P, command: C)
    where
        E: Into<String>,
        P: Into<String>,
        C: Into<String>,
    {
        self.0
            .entry(engine.into())
            .or_default()
            .insert(platform.into(), command.into());
    }

    /// Exact (engine, platform) lookup
    pub fn lookup(&self, engine: &str, platform: &str) -> Option<&str> {
        self.0
            .get(engine)
            .and_then(|platforms| platforms.get(platform))
            .map(String::as_str)
    }
}

/// Configuration for capture calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Engine identifier, selects the command table column
    pub engine: String,
    /// Explicit command line; wins over the command table
    pub command: Option<String>,
    /// Per-engine, per-platform command lines
    pub commands: CommandTable,
    /// Render protocol passed to the renderer as its first positional argument
    pub script: String,
    /// Subprocess hard limit in milliseconds
    #[serde(alias = "timeout")]
    pub timeout_ms: u64,
    /// Enable the cache gate
    pub cache: bool,
    /// Enable post-processing
    pub compress: bool,
    /// Output directory for artifacts and the cache index
    pub storage: PathBuf,
    /// Default option overrides merged under every request
    pub options: PageSettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            command: None,
            commands: CommandTable::new(),
            script: DEFAULT_SCRIPT.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            cache: false,
            compress: false,
            storage: PathBuf::from("storage"),
            options: PageSettings::default(),
        }
    }
}

impl CaptureConfig {
    /// Create a new config builder
    pub fn builder() -> CaptureConfigBuilder {
        CaptureConfigBuilder::default()
    }

    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse a configuration from JSON text
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Apply `SHOTCACHE_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(storage) = std::env::var(STORAGE_ENV_VAR) {
            if !storage.is_empty() {
                self.storage = PathBuf::from(storage);
            }
        }
        if let Ok(timeout) = std::env::var(TIMEOUT_ENV_VAR) {
            self.timeout_ms = timeout.parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be an integer: {}", TIMEOUT_ENV_VAR, timeout))
            })?;
        }
        if let Ok(command) = std::env::var(COMMAND_ENV_VAR) {
            if !command.is_empty() {
                self.command = Some(command);
            }
        }
        Ok(self)
    }

    /// Resolve the render command for the current platform
    pub fn resolve_command(&self) -> Result<Vec<String>, ConfigError> {
        self.resolve_command_for(std::env::consts::OS)
    }

    /// Resolve the render command for a given platform
    ///
    /// Order: explicit `command`, then `commands[engine][platform]`, then
    /// [`DEFAULT_COMMAND`].
    pub fn resolve_command_for(&self, platform: &str) -> Result<Vec<String>, ConfigError> {
        let line = self
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.commands.lookup(&self.engine, platform))
            .unwrap_or(DEFAULT_COMMAND);

        let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        debug!(engine = %self.engine, platform, command = ?tokens, "Resolved render command");
        Ok(tokens)
    }
}

/// Builder for CaptureConfig
#[derive(Default)]
pub struct CaptureConfigBuilder {
    config: CaptureConfig,
}

impl CaptureConfigBuilder {
    /// Set the engine identifier
    pub fn engine<S: Into<String>>(mut self, engine: S) -> Self {
        self.config.engine = engine.into();
        self
    }

    /// Set an explicit command line
    pub fn command<S: Into<String>>(mut self, command: S) -> Self {
        self.config.command = Some(command.into());
        self
    }

    /// Register a command table entry
    pub fn platform_command<E, P, C>(mut self, engine: E, platform: P, command: C) -> Self
    where
        E: Into<String>,
        P: Into<String>,
        C: Into<String>,
    {
        self.config.commands.insert(engine, platform, command);
        self
    }

    /// Set the render protocol argument
    pub fn script<S: Into<String>>(mut self, script: S) -> Self {
        self.config.script = script.into();
        self
    }

    /// Set the subprocess timeout
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    /// Enable/disable the cache gate
    pub fn cache(mut self, cache: bool) -> Self {
        self.config.cache = cache;
        self
    }

    /// Enable/disable post-processing
    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    /// Set the storage directory
    pub fn storage<P: Into<PathBuf>>(mut self, storage: P) -> Self {
        self.config.storage = storage.into();
        self
    }

    /// Set default option overrides
    pub fn options(mut self, options: PageSettings) -> Self {
        self.config.options = options;
        self
    }

    /// Build the config
    pub fn build(self) -> CaptureConfig {
        self.config
    }
}
