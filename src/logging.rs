//! Logging infrastructure - structured tracing for the thunk pool
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level through the environment
//! - Zero-cost when disabled
//! - Console or file output, human-readable or JSON

use std::io;
use std::path::Path;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the file writer thread alive for the rest of the process
static FILE_GUARD: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console (stderr) when unset
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // TYPTHON_THUNKS_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("TYPTHON_THUNKS_LOG_LEVEL") {
            config.level = parse_level(&level_str).unwrap_or(config.level);
        }

        // TYPTHON_THUNKS_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("TYPTHON_THUNKS_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("TYPTHON_THUNKS_LOG_JSON").is_ok();
        config.show_spans = std::env::var("TYPTHON_THUNKS_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging free list corruption
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(value: &str) -> Option<Level> {
    match value.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call has an effect. If another subscriber is already
/// installed, it is left in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_env("TYPTHON_THUNKS_LOG").unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "typthon_thunks={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = match config.log_path.as_deref() {
            Some(path) => file_writer(Path::new(path)),
            None => BoxMakeWriter::new(io::stderr),
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));

        let registry = tracing_subscriber::registry().with(env_filter);
        let installed = if config.json_format {
            registry.with(layer.json()).try_init()
        } else {
            registry.with(layer).try_init()
        };

        if installed.is_ok() {
            debug!(level = %config.level, json = config.json_format, "thunk pool logging ready");
        }
    });
}

/// Non-blocking appender for `path`, keeping its worker guard alive
fn file_writer(path: &Path) -> BoxMakeWriter {
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "typthon_thunks.log".into());

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    *FILE_GUARD.lock() = Some(guard);
    BoxMakeWriter::new(writer)
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Log a thunk handed out by a heap
#[inline]
pub fn log_thunk_allocated(thunk: usize, data_cell: usize) {
    trace!(
        event = "thunk_alloc",
        thunk = ?(thunk as *const ()),
        data_cell = ?(data_cell as *const ()),
        "thunk allocated"
    );
}

/// Log a thunk returned to a heap
#[inline]
pub fn log_thunk_freed(thunk: usize) {
    trace!(
        event = "thunk_free",
        thunk = ?(thunk as *const ()),
        "thunk freed"
    );
}

/// Log a heap acquiring another block pair
pub fn log_heap_expanded(code_block: usize, blocks: usize, free: usize) {
    debug!(
        event = "heap_expand",
        code_block = ?(code_block as *const ()),
        blocks,
        free,
        "thunk heap expanded"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::WARN);
        assert!(config.log_path.is_none());

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert!(debug_config.show_spans);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init(); // Should not panic
        assert!(is_initialized());
    }
}
