use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let unique = env::var("MIRROR_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = env::var("MIRROR_LOG_FILE")
            .ok()
            .map(|path| log_file_path(PathBuf::from(path), unique));

        let json_format = env::var("MIRROR_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Insert the process id before the extension when unique logs are requested
fn log_file_path(mut path: PathBuf, unique: bool) -> PathBuf {
    if !unique {
        return path;
    }

    if let Some(stem) = path.file_stem() {
        let pid = std::process::id();
        let unique_name = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if !ext.is_empty() => format!("{}.{}.{}", stem.to_string_lossy(), pid, ext),
            _ => format!("{}.{}", stem.to_string_lossy(), pid),
        };
        path.set_file_name(unique_name);
    }
    path
}

/// Initialize the logging system based on configuration
///
/// Stdout is never written to: when embedding the editor over stdio the
/// streams belong to the RPC channel.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let (writer, ansi) = match &config.file_path {
        Some(file_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json_format {
        registry
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .init();
    }

    Ok(())
}

/// Log one RPC message (request, response or notification) in one line
#[macro_export]
macro_rules! log_rpc_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            pid = std::process::id(),
            "RPC message"
        );
    };
}

/// Log the duration of an operation
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path_unique() {
        let path = log_file_path(PathBuf::from("/tmp/mirror.log"), true);
        let expected = format!("mirror.{}.log", std::process::id());
        assert_eq!(path.file_name().unwrap().to_string_lossy(), expected);

        let path = log_file_path(PathBuf::from("/tmp/mirror"), true);
        let expected = format!("mirror.{}", std::process::id());
        assert_eq!(path.file_name().unwrap().to_string_lossy(), expected);
    }

    #[test]
    fn test_log_file_path_plain() {
        let path = log_file_path(PathBuf::from("/tmp/mirror.log"), false);
        assert_eq!(path, PathBuf::from("/tmp/mirror.log"));
    }

    #[test]
    fn test_with_overrides() {
        let config = LogConfig::default()
            .with_overrides(Some("debug".to_string()), Some(PathBuf::from("/tmp/x.log")));
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/x.log")));
        assert!(!config.json_format);
    }
}
