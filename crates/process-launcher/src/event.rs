//! Captured output lines and log level inference

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Source of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Severity of a captured line, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace output
    Trace,
    /// Debug output
    Debug,
    /// Informational output (the fallback)
    #[default]
    Info,
    /// Warnings
    Warn,
    /// Errors, fatals and panics
    Error,
}

static ERROR_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(ERROR|FATAL|SEVERE|PANIC|panicked|Exception)\b").ok());
static WARN_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(WARN|WARNING)\b").ok());
static DEBUG_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\bDEBUG\b").ok());
static TRACE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\bTRACE\b").ok());

fn matches(pattern: &LazyLock<Option<Regex>>, line: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(line))
}

impl LogLevel {
    /// Infer a level from the markers build tools and frameworks put in a line.
    ///
    /// Maven, Gradle, Spring, npm and `tracing` all print an upper-case level
    /// token; anything without one is `Info`.
    pub fn infer(line: &str) -> Self {
        if matches(&ERROR_PATTERN, line) {
            LogLevel::Error
        } else if matches(&WARN_PATTERN, line) {
            LogLevel::Warn
        } else if matches(&DEBUG_PATTERN, line) {
            LogLevel::Debug
        } else if matches(&TRACE_PATTERN, line) {
            LogLevel::Trace
        } else {
            LogLevel::Info
        }
    }

    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One line of process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// When the line was read
    pub timestamp: DateTime<Utc>,
    /// Which stream it came from
    pub source: LogSource,
    /// Inferred severity
    pub level: LogLevel,
    /// The line without its trailing newline
    pub line: String,
}

impl OutputLine {
    /// Capture a line now, inferring its level
    pub fn new(source: LogSource, line: impl Into<String>) -> Self {
        let line = line.into();
        Self {
            timestamp: Utc::now(),
            source,
            level: LogLevel::infer(&line),
            line,
        }
    }
}
