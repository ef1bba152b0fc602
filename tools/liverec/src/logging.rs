use crate::errors::{io_err, RecorderError};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), RecorderError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let mut line = serde_json::to_string(&LogEvent {
            payload: truncated,
            ..event.clone()
        })
        .map_err(|e| RecorderError::Io(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn run_logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route lifecycle events for this process to `path`.
pub fn init_run_logger(path: impl AsRef<Path>) {
    *run_logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(JsonlLogger::new(path));
}

pub fn clear_run_logger() {
    *run_logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

/// Append a lifecycle event to the run log, if one is configured.
///
/// Logging failures are swallowed: diagnostics never change the outcome of a
/// recorder operation.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = run_logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let Some(logger) = logger else {
        return;
    };
    let _ = logger.append(&LogEvent {
        timestamp_ns: timestamp_ns(),
        pid: std::process::id(),
        level,
        event_type,
        payload,
    });
}

pub fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
