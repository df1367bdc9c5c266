use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use strum_macros::Display;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::constants::LogLevel;

/// Severity of a single log line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// The lowest verbosity at which lines of this severity are emitted.
    pub fn threshold(self) -> LogLevel {
        match self {
            Severity::Error | Severity::Warn => LogLevel::Errors,
            Severity::Info => LogLevel::Result,
            Severity::Debug => LogLevel::Debug,
        }
    }
}

/// Where log lines end up. Formatting and prefixes are the sink's business.
pub trait LoggerType: Send + Sync {
    fn log(&self, severity: Severity, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

/// A sink plus the verbosity chosen for one attach call.
pub struct Logger {
    sink: Box<dyn LoggerType>,
    level: LogLevel,
}

impl Logger {
    pub fn new(sink: Box<dyn LoggerType>, level: LogLevel) -> Self {
        Self { sink, level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        self.level >= severity.threshold()
    }

    pub fn log(&self, severity: Severity, context: &str, msg: &str) {
        if self.enabled(severity) {
            self.sink.log(severity, context, msg);
        }
    }

    pub fn debug(&self, context: &str, msg: &str) {
        self.log(Severity::Debug, context, msg)
    }

    pub fn info(&self, context: &str, msg: &str) {
        self.log(Severity::Info, context, msg)
    }

    pub fn warn(&self, context: &str, msg: &str) {
        self.log(Severity::Warn, context, msg)
    }

    pub fn error(&self, context: &str, msg: &str) {
        self.log(Severity::Error, context, msg)
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger {
            sink: self.sink.clone_box(),
            level: self.level,
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("sink", &self.sink.debug_box())
            .field("level", &self.level)
            .finish()
    }
}

/// Forwards every line to `tracing`, with the port name as the `context` field.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl LoggerType for TracingLogger {
    fn log(&self, severity: Severity, context: &str, msg: &str) {
        match severity {
            Severity::Debug => tracing::debug!(%context, "{msg}"),
            Severity::Info => tracing::info!(%context, "{msg}"),
            Severity::Warn => tracing::warn!(%context, "{msg}"),
            Severity::Error => tracing::error!(%context, "{msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub severity: Severity,
    pub context: String,
    pub msg: String,
}

/// Keeps every line in memory. Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<LogLine> {
        self.lines()
            .into_iter()
            .filter(|line| line.severity == severity)
            .collect()
    }

    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.with_severity(severity)
            .iter()
            .any(|line| line.msg.contains(needle))
    }
}

impl LoggerType for MemoryLogger {
    fn log(&self, severity: Severity, context: &str, msg: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogLine {
                severity,
                context: context.to_string(),
                msg: msg.to_string(),
            });
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MemoryLogger({} lines)", self.lines().len())
    }
}

/// Installs the global tracing subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or `"portbridge=debug"`).
/// - `log_file`, when given, receives daily rolling logs instead of stdout.
/// - `json` switches to newline-delimited JSON.
pub fn init_tracing(log_level: &str, log_file: Option<PathBuf>, json: bool) -> Result<TracingLogger> {
    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level directive `{log_level}`"))?;

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .context("log file path has no file name")?
                .to_owned();
            fs::create_dir_all(&dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
            if json {
                Registry::default()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(appender).with_ansi(false))
                    .try_init()?;
            } else {
                Registry::default()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(appender).with_ansi(false))
                    .try_init()?;
            }
        }
        None => {
            if json {
                Registry::default()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .try_init()?;
            } else {
                Registry::default()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false))
                    .try_init()?;
            }
        }
    }

    Ok(TracingLogger::new())
}
