//! Internal logging system for Lumen
//!
//! This module provides a pluggable logging system with:
//! - Customizable logger via Logger trait
//! - Severity levels (Trace, Debug, Info, Warn, Error) with a global minimum
//! - Colored console output by default
//! - File and line information for ERROR logs
//! - `lumen_err!` / `lumen_bail!` which log and build an [`Error`](crate::error::Error)

use colored::*;
use std::time::SystemTime;
use chrono::{DateTime, Local};

/// Logger trait for custom logging implementations
///
/// # Example
///
/// ```no_run
/// use lumen_rt::lumen::log::{Logger, LogEntry};
///
/// struct CaptureLogger;
///
/// impl Logger for CaptureLogger {
///     fn log(&self, entry: &LogEntry) {
///         eprintln!("{}: {}", entry.source, entry.message);
///     }
/// }
/// ```
pub trait Logger: Send + Sync {
    /// Log an entry
    fn log(&self, entry: &LogEntry);
}

/// Log entry containing all information about a log message
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity level
    pub severity: LogSeverity,

    /// Timestamp when the log was created
    pub timestamp: SystemTime,

    /// Source component (e.g., "lumen::TopLevelIndex", "lumen::vulkan")
    pub source: String,

    /// Log message
    pub message: String,

    /// Source file (only for detailed ERROR logs)
    pub file: Option<&'static str>,

    /// Source line (only for detailed ERROR logs)
    pub line: Option<u32>,
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    /// Very verbose tracing (per entry, per command)
    Trace,

    /// Development/debugging information
    Debug,

    /// Important informational messages (builds, bring-up)
    Info,

    /// Potential issues (aborted frames, rebuild fallbacks)
    Warn,

    /// Errors, logged with file:line
    Error,
}

/// Colored console logger, one line per entry
///
/// `[timestamp] [SEVERITY] [source] message`, with ` (file:line)` appended
/// when the entry carries a location.
pub struct DefaultLogger;

impl DefaultLogger {
    pub fn format_line(entry: &LogEntry) -> String {
        let datetime: DateTime<Local> = entry.timestamp.into();
        let severity = match entry.severity {
            LogSeverity::Trace => "TRACE".bright_black(),
            LogSeverity::Debug => "DEBUG".cyan(),
            LogSeverity::Info => "INFO ".green(),
            LogSeverity::Warn => "WARN ".yellow(),
            LogSeverity::Error => "ERROR".red().bold(),
        };
        let mut line = format!(
            "[{}] [{}] [{}] {}",
            datetime.format("%H:%M:%S%.3f"),
            severity,
            entry.source.bright_blue(),
            entry.message
        );
        if let (Some(file), Some(number)) = (entry.file, entry.line) {
            line.push_str(&format!(" ({}:{})", file, number));
        }
        line
    }
}

impl Logger for DefaultLogger {
    fn log(&self, entry: &LogEntry) {
        println!("{}", Self::format_line(entry));
    }
}

// ===== LOGGING MACROS =====

/// Log a TRACE message
///
/// ```no_run
/// lumen_rt::lumen_trace!("lumen::DispatchTable", "entry {} written", 3);
/// ```
#[macro_export]
macro_rules! lumen_trace {
    ($source:expr, $($arg:tt)*) => {
        $crate::lumen::Lumen::log(
            $crate::lumen::log::LogSeverity::Trace,
            $source,
            format!($($arg)*)
        )
    };
}

/// Log a DEBUG message
#[macro_export]
macro_rules! lumen_debug {
    ($source:expr, $($arg:tt)*) => {
        $crate::lumen::Lumen::log(
            $crate::lumen::log::LogSeverity::Debug,
            $source,
            format!($($arg)*)
        )
    };
}

/// Log an INFO message
#[macro_export]
macro_rules! lumen_info {
    ($source:expr, $($arg:tt)*) => {
        $crate::lumen::Lumen::log(
            $crate::lumen::log::LogSeverity::Info,
            $source,
            format!($($arg)*)
        )
    };
}

/// Log a WARN message
#[macro_export]
macro_rules! lumen_warn {
    ($source:expr, $($arg:tt)*) => {
        $crate::lumen::Lumen::log(
            $crate::lumen::log::LogSeverity::Warn,
            $source,
            format!($($arg)*)
        )
    };
}

/// Log an ERROR message with file:line information
#[macro_export]
macro_rules! lumen_error {
    ($source:expr, $($arg:tt)*) => {
        $crate::lumen::Lumen::log_detailed(
            $crate::lumen::log::LogSeverity::Error,
            $source,
            format!($($arg)*),
            file!(),
            line!()
        )
    };
}

/// Log an ERROR and evaluate to an `Error` value.
///
/// With a variant name the message is wrapped in that variant, otherwise it
/// becomes an `Error::BackendError`.
///
/// ```no_run
/// # use lumen_rt::lumen::Error;
/// let err: Error = lumen_rt::lumen_err!("lumen::DispatchTable", OutOfRange, "entry {} of {}", 5, 2);
/// let backend: Error = lumen_rt::lumen_err!("lumen::vulkan", "queue submit failed");
/// ```
#[macro_export]
macro_rules! lumen_err {
    ($source:expr, $kind:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let message = format!($fmt $(, $arg)*);
        $crate::lumen::Lumen::log_detailed(
            $crate::lumen::log::LogSeverity::Error,
            $source,
            message.clone(),
            file!(),
            line!()
        );
        $crate::lumen::Error::$kind(message)
    }};
    ($source:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::lumen_err!($source, BackendError, $fmt $(, $arg)*)
    };
}

/// Log an ERROR and return early with `Err(..)`.
///
/// Same arguments as [`lumen_err!`].
#[macro_export]
macro_rules! lumen_bail {
    ($($arg:tt)*) => {
        return Err($crate::lumen_err!($($arg)*))
    };
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
