// src/util/log.rs

//! Logging bootstrap. Every `log_*!` macro emits a `tracing` event; when a file
//! sink has been installed the line is also appended to a per-level file.
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use chrono::Local;
use tracing::Level;

use crate::config::SyncConfig;

pub static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Optional file sink, installed by [`init`] when a log directory is configured.
pub static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Log severity levels
#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_str(&self) -> &str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Logger that writes to separate files by severity
pub struct Logger {
    log_dir: PathBuf,
    error_file: Mutex<File>,
    warn_file: Mutex<File>,
    info_file: Mutex<File>,
    debug_file: Mutex<File>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("log_dir", &self.log_dir).finish()
    }
}

impl Logger {
    /// Create a new logger with the specified directory
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        let log_dir = log_dir.to_path_buf();
        create_dir_all(&log_dir)?;

        // Truncated on every start
        let error_file = File::create(log_dir.join("error.log"))?;
        let warn_file = File::create(log_dir.join("warn.log"))?;
        let info_file = File::create(log_dir.join("info.log"))?;
        let debug_file = File::create(log_dir.join("debug.log"))?;

        Ok(Self {
            log_dir,
            error_file: Mutex::new(error_file),
            warn_file: Mutex::new(warn_file),
            info_file: Mutex::new(info_file),
            debug_file: Mutex::new(debug_file),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn write_log(&self, level: LogLevel, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let formatted = format!("[{}] [{}] {}\n", timestamp, level.as_str(), message);

        let file = match level {
            LogLevel::Error => &self.error_file,
            LogLevel::Warn => &self.warn_file,
            LogLevel::Info => &self.info_file,
            LogLevel::Debug => &self.debug_file,
        };

        if let Ok(mut file) = file.lock() {
            let _ = file.write_all(formatted.as_bytes());
            let _ = file.flush();
        }
    }
}

/// Install the `tracing` subscriber and, if configured, the file sink.
/// Safe to call more than once; later calls only fill in what is missing.
pub fn init(config: &SyncConfig) -> std::io::Result<()> {
    let debug = *DEBUG_ENABLED.get_or_init(|| config.debug);
    let level = if debug { Level::DEBUG } else { Level::INFO };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    if let Some(dir) = &config.log_dir {
        if LOGGER.get().is_none() {
            let _ = LOGGER.set(Logger::new(dir)?);
        }
    }

    Ok(())
}

#[doc(hidden)]
pub fn to_file(level: LogLevel, message: &str) {
    if let Some(logger) = LOGGER.get() {
        logger.write_log(level, message);
    }
}

#[doc(hidden)]
pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get().unwrap_or(&false)
}

/// Convenience macro for error logging with formatting
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        ::tracing::error!("{}", message);
        $crate::util::log::to_file($crate::util::log::LogLevel::Error, &message);
    }};
}

/// Convenience macro for warning logging with formatting
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        ::tracing::warn!("{}", message);
        $crate::util::log::to_file($crate::util::log::LogLevel::Warn, &message);
    }};
}

/// Convenience macro for info logging with formatting
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        ::tracing::info!("{}", message);
        $crate::util::log::to_file($crate::util::log::LogLevel::Info, &message);
    }};
}

/// Convenience macro for debug logging with formatting
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        ::tracing::debug!("{}", message);
        if $crate::util::log::debug_enabled() {
            $crate::util::log::to_file($crate::util::log::LogLevel::Debug, &message);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_logger_creates_level_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(temp_dir.path()).expect("Failed to create logger");

        logger.write_log(LogLevel::Error, "pump command rejected");
        logger.write_log(LogLevel::Info, "connected to 192.168.1.50");

        for name in ["error.log", "warn.log", "info.log", "debug.log"] {
            assert!(temp_dir.path().join(name).exists());
        }

        let errors = fs::read_to_string(temp_dir.path().join("error.log")).unwrap();
        assert!(errors.contains("[ERROR] pump command rejected"));
        let warnings = fs::read_to_string(temp_dir.path().join("warn.log")).unwrap();
        assert!(warnings.is_empty());
    }
}
