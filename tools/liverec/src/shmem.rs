//! Shared-memory access log.
//!
//! Several independent processes that map the same region can log their
//! accesses into one `.shmem` file. Each record is a single JSON line written
//! with one `write` on an `O_APPEND` descriptor while holding an exclusive
//! `flock`, so lines from different writers never interleave. Existing logs
//! are appended to and never truncated.

use crate::errors::{io_err, RecorderError};
use crate::runtime::Clock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SHMEM_LOG_EXTENSION: &str = "shmem";
pub const DEFAULT_SHMEM_LOG_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShmemLogConfig {
    pub filename: Option<PathBuf>,
    /// Requested maximum size in bytes; zero selects the default.
    pub max_size_bytes: u64,
}

impl ShmemLogConfig {
    /// Size the log is actually capped at: the requested (or default) size
    /// rounded up to a whole number of pages.
    pub fn effective_max_size(&self) -> u64 {
        let requested = if self.max_size_bytes == 0 {
            DEFAULT_SHMEM_LOG_SIZE
        } else {
            self.max_size_bytes
        };
        round_up_to_page(requested, page_size())
    }
}

pub fn validate_shmem_filename(path: &Path) -> Result<(), RecorderError> {
    let has_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == SHMEM_LOG_EXTENSION)
        .unwrap_or(false);
    let has_stem = path
        .file_stem()
        .map(|stem| !stem.is_empty())
        .unwrap_or(false);
    if has_extension && has_stem {
        return Ok(());
    }
    Err(RecorderError::InvalidArgument(format!(
        "shared memory log {} must have a .{SHMEM_LOG_EXTENSION} extension",
        path.display()
    )))
}

pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

fn round_up_to_page(bytes: u64, page: u64) -> u64 {
    bytes.div_ceil(page).saturating_mul(page)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmemAccess {
    pub address: u64,
    pub len: u64,
    pub kind: AccessKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmemAccessRecord {
    pub pid: u32,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub address: u64,
    pub len: u64,
    pub kind: AccessKind,
}

/// One process's writer into a shared log file.
pub struct ShmemLogWriter {
    path: PathBuf,
    file: File,
    clock: Arc<dyn Clock>,
    max_size: u64,
    pid: u32,
    next_seq: u64,
    written: u64,
    dropped: u64,
}

impl ShmemLogWriter {
    pub fn open(
        config: &ShmemLogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Option<Self>, RecorderError> {
        let Some(path) = &config.filename else {
            return Ok(None);
        };
        validate_shmem_filename(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        Ok(Some(Self {
            path: path.clone(),
            file,
            clock,
            max_size: config.effective_max_size(),
            pid: std::process::id(),
            next_seq: 0,
            written: 0,
            dropped: 0,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Appends one access record. Returns `Ok(false)` when the record was
    /// dropped because the log reached its maximum size.
    pub fn append(&mut self, access: ShmemAccess) -> Result<bool, RecorderError> {
        let record = ShmemAccessRecord {
            pid: self.pid,
            seq: self.next_seq,
            timestamp_ns: self.clock.now_ns(),
            address: access.address,
            len: access.len,
            kind: access.kind,
        };
        let mut line =
            serde_json::to_string(&record).map_err(|e| RecorderError::Io(e.to_string()))?;
        line.push('\n');

        let _lock = FileLock::exclusive(&self.file)?;
        let current = self.file.metadata().map_err(io_err)?.len();
        if current + line.len() as u64 > self.max_size {
            self.dropped += 1;
            return Ok(false);
        }
        (&self.file).write_all(line.as_bytes()).map_err(io_err)?;
        self.next_seq += 1;
        self.written += 1;
        Ok(true)
    }
}

struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> Result<Self, RecorderError> {
        // SAFETY: the descriptor belongs to `file`, which outlives the guard.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result != 0 {
            return Err(io_err(std::io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: see `exclusive`; unlocking an unlocked descriptor is harmless.
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Summary of a shared-memory log read back from disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShmemLogContents {
    pub records: Vec<ShmemAccessRecord>,
    /// Lines that did not parse; a writer killed mid-line leaves one behind.
    pub malformed_lines: usize,
}

impl ShmemLogContents {
    pub fn writers(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.records.iter().map(|r| r.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

pub fn read_shmem_log(path: &Path) -> Result<ShmemLogContents, RecorderError> {
    let file = File::open(path).map_err(io_err)?;
    let mut contents = ShmemLogContents::default();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ShmemAccessRecord>(&line) {
            Ok(record) => contents.records.push(record),
            Err(_) => contents.malformed_lines += 1,
        }
    }
    Ok(contents)
}
