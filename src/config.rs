//! Configuration for mirror sessions
//!
//! Provides MirrorConfig with a validating builder, editor executable
//! resolution and startup file discovery.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Environment variable overriding the editor executable
pub const NVIM_PATH_ENV: &str = "MIRROR_NVIM_PATH";

/// Executable used when neither CLI nor environment name one
pub const DEFAULT_NVIM_PATH: &str = "nvim";

/// Directory under the config base holding the startup file
pub const CONFIG_DIR_NAME: &str = "nvim-mirror";

/// Startup file candidates, in precedence order
pub const STARTUP_FILE_CANDIDATES: [&str; 2] = ["init.lua", "init.vim"];

/// Flags selecting embedded headless RPC mode without shada or swap files
pub const STARTUP_FLAGS: [&str; 5] = ["--embed", "--headless", "-n", "-i", "NONE"];

/// Exit status treated as a deliberate shutdown
pub const DEFAULT_EXPECTED_EXIT_CODE: i32 = 0;

/// Events that republish the cursor state
pub const DEFAULT_CURSOR_EVENTS: [&str; 3] = ["CursorMoved", "CursorMovedI", "ModeChanged"];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid working directory: {path}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Size of the grid announced by the UI attach handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiOptions {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone)]
pub struct MirrorConfig {
    /// Editor executable
    pub nvim_path: String,

    /// Arguments appended after the fixed startup flags
    pub extra_args: Vec<String>,

    /// Working directory of the editor process
    pub working_directory: Option<PathBuf>,

    /// Startup file passed with `-u`; `None` starts with `-u NONE`
    pub startup_file: Option<PathBuf>,

    /// Per-call timeout; `None` waits until the session closes
    pub request_timeout: Option<Duration>,

    /// Exit status treated as a deliberate reset rather than a failure
    pub expected_exit_code: i32,

    /// Perform the UI attach handshake at startup
    pub ui: Option<UiOptions>,

    /// Autocmd events publishing the cursor state
    pub cursor_events: Vec<String>,

    /// Receives every stderr line of the editor process
    pub stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl std::fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("nvim_path", &self.nvim_path)
            .field("extra_args", &self.extra_args)
            .field("working_directory", &self.working_directory)
            .field("startup_file", &self.startup_file)
            .field("request_timeout", &self.request_timeout)
            .field("expected_exit_code", &self.expected_exit_code)
            .field("ui", &self.ui)
            .field("cursor_events", &self.cursor_events)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            nvim_path: DEFAULT_NVIM_PATH.to_string(),
            extra_args: Vec::new(),
            working_directory: None,
            startup_file: None,
            request_timeout: None,
            expected_exit_code: DEFAULT_EXPECTED_EXIT_CODE,
            ui: None,
            cursor_events: DEFAULT_CURSOR_EVENTS.iter().map(|e| e.to_string()).collect(),
            stderr_handler: None,
        }
    }
}

impl MirrorConfig {
    pub fn builder() -> MirrorConfigBuilder {
        MirrorConfigBuilder::new()
    }

    /// Full argument list for the editor process
    pub fn command_args(&self) -> Vec<String> {
        let mut args: Vec<String> = STARTUP_FLAGS.iter().map(|flag| flag.to_string()).collect();
        args.push("-u".to_string());
        args.push(match &self.startup_file {
            Some(file) => file.to_string_lossy().into_owned(),
            None => "NONE".to_string(),
        });
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Editor executable: CLI argument, then `MIRROR_NVIM_PATH`, then `nvim`
pub fn resolve_nvim_path(cli: Option<String>) -> String {
    choose_nvim_path(cli, std::env::var(NVIM_PATH_ENV).ok())
}

fn choose_nvim_path(cli: Option<String>, env: Option<String>) -> String {
    cli.filter(|path| !path.is_empty())
        .or(env.filter(|path| !path.is_empty()))
        .unwrap_or_else(|| DEFAULT_NVIM_PATH.to_string())
}

/// Directory searched for the startup file
///
/// `$XDG_CONFIG_HOME` when set and non-empty, else `<home>/.config`, joined
/// with [`CONFIG_DIR_NAME`].
pub fn config_dir() -> Option<PathBuf> {
    config_dir_from(std::env::var_os("XDG_CONFIG_HOME"), dirs::home_dir())
}

fn config_dir_from(xdg_config_home: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    let base = match xdg_config_home.filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home?.join(".config"),
    };
    Some(base.join(CONFIG_DIR_NAME))
}

/// First existing startup file candidate in `dir`
pub fn discover_startup_file(dir: &Path) -> Option<PathBuf> {
    STARTUP_FILE_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for MirrorConfig with validation and defaults
#[derive(Default)]
pub struct MirrorConfigBuilder {
    nvim_path: Option<String>,
    extra_args: Vec<String>,
    working_directory: Option<PathBuf>,
    startup_file: Option<PathBuf>,
    discover_startup_file: bool,
    request_timeout: Option<Duration>,
    expected_exit_code: Option<i32>,
    ui: Option<UiOptions>,
    cursor_events: Option<Vec<String>>,
    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl MirrorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nvim_path(mut self, path: impl Into<String>) -> Self {
        self.nvim_path = Some(path.into());
        self
    }

    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn add_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Use this startup file instead of discovering one
    pub fn startup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.startup_file = Some(path.into());
        self
    }

    /// Look for a startup file in [`config_dir`] when none is set
    pub fn discover_startup_file(mut self, enabled: bool) -> Self {
        self.discover_startup_file = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn expected_exit_code(mut self, code: i32) -> Self {
        self.expected_exit_code = Some(code);
        self
    }

    pub fn ui(mut self, width: u32, height: u32) -> Self {
        self.ui = Some(UiOptions { width, height });
        self
    }

    pub fn cursor_events(mut self, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cursor_events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<MirrorConfig, ConfigError> {
        let defaults = MirrorConfig::default();

        let nvim_path = self.nvim_path.unwrap_or(defaults.nvim_path);
        let cursor_events = self.cursor_events.unwrap_or(defaults.cursor_events);
        let startup_file = match self.startup_file {
            Some(file) => Some(file),
            None if self.discover_startup_file => {
                config_dir().and_then(|dir| discover_startup_file(&dir))
            }
            None => None,
        };

        Self::validate_nvim_path(&nvim_path)?;
        if let Some(dir) = &self.working_directory {
            Self::validate_working_directory(dir)?;
        }
        Self::validate_timeout(self.request_timeout)?;
        Self::validate_ui(self.ui)?;
        Self::validate_cursor_events(&cursor_events)?;

        Ok(MirrorConfig {
            nvim_path,
            extra_args: self.extra_args,
            working_directory: self.working_directory,
            startup_file,
            request_timeout: self.request_timeout,
            expected_exit_code: self
                .expected_exit_code
                .unwrap_or(DEFAULT_EXPECTED_EXIT_CODE),
            ui: self.ui,
            cursor_events,
            stderr_handler: self.stderr_handler,
        })
    }

    fn validate_nvim_path(path: &str) -> Result<(), ConfigError> {
        if path.trim().is_empty() {
            return Err(ConfigError::invalid("nvim_path", "must not be empty"));
        }
        Ok(())
    }

    fn validate_working_directory(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::WorkingDirectory {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Working directory does not exist",
                ),
            });
        }

        if !path.is_dir() {
            return Err(ConfigError::WorkingDirectory {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Working directory path is not a directory",
                ),
            });
        }

        Ok(())
    }

    fn validate_timeout(timeout: Option<Duration>) -> Result<(), ConfigError> {
        match timeout {
            Some(timeout) if timeout.is_zero() => {
                Err(ConfigError::invalid("request_timeout", "must be greater than zero"))
            }
            _ => Ok(()),
        }
    }

    fn validate_ui(ui: Option<UiOptions>) -> Result<(), ConfigError> {
        match ui {
            Some(UiOptions { width, height }) if width == 0 || height == 0 => Err(
                ConfigError::invalid("ui", format!("grid {width}x{height} is empty")),
            ),
            _ => Ok(()),
        }
    }

    fn validate_cursor_events(events: &[String]) -> Result<(), ConfigError> {
        if events.is_empty() {
            return Err(ConfigError::invalid(
                "cursor_events",
                "at least one event is required",
            ));
        }
        if let Some(event) = events.iter().find(|event| event.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "cursor_events",
                format!("invalid event name {event:?}"),
            ));
        }
        Ok(())
    }
}
