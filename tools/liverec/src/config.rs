use crate::errors::RecorderError;
use crate::event_log::DEFAULT_EVENT_LOG_SIZE;
use crate::runtime::FileSystem;
use crate::shmem::{validate_shmem_filename, ShmemLogConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub event_log_size: Option<u64>,
    pub include_symbol_files: Option<bool>,
    pub shmem_log: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecorderConfig {
    pub event_log: EventLogConfig,
    pub save: SaveConfig,
    pub shmem: ShmemConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventLogConfig {
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveConfig {
    pub include_symbol_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShmemConfig {
    pub filename: Option<PathBuf>,
    pub max_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            event_log: EventLogConfig {
                size_bytes: DEFAULT_EVENT_LOG_SIZE,
            },
            save: SaveConfig {
                include_symbol_files: true,
            },
            shmem: ShmemConfig {
                filename: None,
                max_size_bytes: 0,
            },
            logging: LoggingConfig { path: None },
        }
    }
}

impl RecorderConfig {
    pub fn shmem_log_config(&self) -> ShmemLogConfig {
        ShmemLogConfig {
            filename: self.shmem.filename.clone(),
            max_size_bytes: self.shmem.max_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRecorderConfig {
    event_log: Option<PartialEventLogConfig>,
    save: Option<PartialSaveConfig>,
    shmem: Option<PartialShmemConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialEventLogConfig {
    size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSaveConfig {
    include_symbol_files: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialShmemConfig {
    filename: Option<PathBuf>,
    max_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    fs: &dyn FileSystem,
) -> Result<RecorderConfig, RecorderError> {
    let mut cfg = RecorderConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialRecorderConfig = toml::from_str(&file_contents)
            .map_err(|e| RecorderError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial, path.parent());
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(
    cfg: &mut RecorderConfig,
    partial: PartialRecorderConfig,
    config_dir: Option<&Path>,
) {
    if let Some(event_log) = partial.event_log {
        if let Some(size_bytes) = event_log.size_bytes {
            cfg.event_log.size_bytes = size_bytes;
        }
    }

    if let Some(save) = partial.save {
        if let Some(include) = save.include_symbol_files {
            cfg.save.include_symbol_files = include;
        }
    }

    if let Some(shmem) = partial.shmem {
        if let Some(filename) = shmem.filename {
            cfg.shmem.filename = Some(relative_to(config_dir, filename));
        }
        if let Some(value) = shmem.max_size_bytes {
            cfg.shmem.max_size_bytes = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(relative_to(config_dir, path));
        }
    }
}

fn apply_cli_overrides(cfg: &mut RecorderConfig, overrides: &CliOverrides) {
    if let Some(size) = overrides.event_log_size {
        cfg.event_log.size_bytes = size;
    }
    if let Some(include) = overrides.include_symbol_files {
        cfg.save.include_symbol_files = include;
    }
    if let Some(shmem) = &overrides.shmem_log {
        cfg.shmem.filename = Some(shmem.clone());
    }
    if let Some(log_path) = &overrides.log_path {
        cfg.logging.path = Some(log_path.clone());
    }
}

/// Paths in a config file are relative to the directory holding the file.
fn relative_to(base: Option<&Path>, value: PathBuf) -> PathBuf {
    match base {
        Some(base) if value.is_relative() && !base.as_os_str().is_empty() => base.join(value),
        _ => value,
    }
}

fn validate_config(cfg: &RecorderConfig) -> Result<(), RecorderError> {
    if cfg.event_log.size_bytes == 0 {
        return Err(RecorderError::InvalidConfig(
            "event_log.size_bytes must be greater than zero".to_string(),
        ));
    }
    if cfg.event_log.size_bytes > i64::MAX as u64 {
        return Err(RecorderError::InvalidConfig(
            "event_log.size_bytes is too large".to_string(),
        ));
    }
    if let Some(filename) = &cfg.shmem.filename {
        validate_shmem_filename(filename)
            .map_err(|e| RecorderError::InvalidConfig(e.to_string()))?;
    }
    Ok(())
}
