//! Structured JSON event lines for jq parsing
//!
//! The `ssr-local` binary emits one JSON object per line for lifecycle and
//! traffic events when started with `--json-log`.

use crate::accelerator::AcceleratorStatus;
use crate::config::SessionConfig;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::SystemTime;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp (RFC3339)
    pub timestamp: String,

    pub level: LogLevel,

    /// Component tag, e.g. "accelerator"
    pub component: String,

    pub message: String,

    /// Event fields, flattened into the top-level object
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339(SystemTime::now()).to_string(),
            level,
            component: component.into(),
            message: message.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Add key-value pair to data
    pub fn add_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Write as one JSON line to stdout
    pub fn emit(&self) {
        match self.to_line() {
            Ok(line) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                if let Err(e) = writeln!(out, "{}", line) {
                    log::warn!("Failed to write JSON log line: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to serialize JSON log line: {}", e),
        }
    }
}

/// Event builders for the accelerator binary
pub struct JsonLogger;

impl JsonLogger {
    pub fn session_configured(config: &SessionConfig) -> LogEntry {
        LogEntry::new(LogLevel::Info, "accelerator", "Session configured")
            .add_field("event_type", "configured")
            .add_field("server", format!("{}:{}", config.server_address, config.server_port))
            .add_field("local", format!("{}:{}", config.local_address, config.local_port))
            .add_field("method", config.method.to_string())
            .add_field("obfs", config.obfs.as_str())
    }

    pub fn status_changed(status: &AcceleratorStatus) -> LogEntry {
        let level = match status {
            AcceleratorStatus::Error(_) => LogLevel::Error,
            _ => LogLevel::Info,
        };
        let mut entry = LogEntry::new(level, "accelerator", "Status changed")
            .add_field("event_type", "status")
            .add_field("status", status.code());
        if let AcceleratorStatus::Error(reason) = status {
            entry = entry.add_field("reason", reason.as_str());
        }
        entry
    }

    /// Traffic delta over `interval_ms`
    pub fn traffic(received_delta: u64, sent_delta: u64, interval_ms: u64) -> LogEntry {
        let seconds = (interval_ms.max(1)) as f64 / 1000.0;
        LogEntry::new(LogLevel::Debug, "relay", "Traffic update")
            .add_field("event_type", "traffic")
            .add_field("bytes_received", received_delta)
            .add_field("bytes_sent", sent_delta)
            .add_field(
                "throughput_mbps",
                (received_delta + sent_delta) as f64 * 8.0 / seconds / 1_000_000.0,
            )
    }

    pub fn error(component: impl Into<String>, message: impl Into<String>) -> LogEntry {
        LogEntry::new(LogLevel::Error, component, message).add_field("event_type", "error")
    }
}
