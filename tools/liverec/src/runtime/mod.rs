use crate::errors::{io_err, AttachErrorKind, RecorderError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// What an engine learned about the process when it attached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttachInfo {
    pub pid: u32,
    pub threads: Vec<u64>,
    pub libraries: Vec<PathBuf>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn now_ns(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, RecorderError>;
    fn read(&self, path: &Path) -> Result<Vec<u8>, RecorderError>;
}

/// The instrumentation that actually attaches to a process and records it.
pub trait AttachEngine: Send + Sync {
    fn attach(&self) -> Result<AttachInfo, AttachErrorKind>;
    fn detach(&self);
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RecorderError> {
        std::fs::read_to_string(path).map_err(io_err)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, RecorderError> {
        std::fs::read(path).map_err(io_err)
    }
}

/// Engine for the current process, discovering threads and mapped libraries
/// through procfs.
pub struct InProcessEngine {
    proc_root: PathBuf,
}

impl InProcessEngine {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc/self"),
        }
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn threads(&self) -> Result<Vec<u64>, AttachErrorKind> {
        let entries = std::fs::read_dir(self.proc_root.join("task"))
            .map_err(|_| AttachErrorKind::NoThreadInfo)?;
        let mut threads = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .collect::<Vec<_>>();
        if threads.is_empty() {
            return Err(AttachErrorKind::NoThreadInfo);
        }
        threads.sort_unstable();
        Ok(threads)
    }

    fn libraries(&self) -> Result<Vec<PathBuf>, AttachErrorKind> {
        let maps = std::fs::read_to_string(self.proc_root.join("maps"))
            .map_err(|_| AttachErrorKind::LibrarySearchFailed)?;
        Ok(parse_mapped_libraries(&maps))
    }
}

impl Default for InProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachEngine for InProcessEngine {
    fn attach(&self) -> Result<AttachInfo, AttachErrorKind> {
        let smaps = std::fs::read_to_string(self.proc_root.join("smaps")).unwrap_or_default();
        if uses_protection_keys(&smaps) {
            return Err(AttachErrorKind::ProtectionKeysInUse);
        }
        Ok(AttachInfo {
            pid: std::process::id(),
            threads: self.threads()?,
            libraries: self.libraries()?,
        })
    }

    fn detach(&self) {}
}

/// File-backed shared objects named in a `/proc/<pid>/maps` listing.
pub fn parse_mapped_libraries(maps: &str) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    for line in maps.lines() {
        let Some(path) = line.split_whitespace().nth(5) else {
            continue;
        };
        if path.starts_with('/') && path.contains(".so") {
            seen.insert(PathBuf::from(path));
        }
    }
    seen.into_iter().collect()
}

fn uses_protection_keys(smaps: &str) -> bool {
    smaps
        .lines()
        .filter_map(|line| line.strip_prefix("ProtectionKey:"))
        .any(|value| value.trim().parse::<u32>().map(|key| key != 0).unwrap_or(false))
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        let fs = Self::default();
        fs.insert(path, contents);
        fs
    }

    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), contents.into());
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RecorderError> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| RecorderError::Io(e.to_string()))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, RecorderError> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| RecorderError::Io(format!("missing file {}", path.display())))
    }
}

/// Scriptable engine: queued attach results are consumed in order, and once
/// the queue is empty every attach succeeds with `default_info`.
#[derive(Default, Clone)]
pub struct FakeAttachEngine {
    responses: Arc<Mutex<Vec<Result<AttachInfo, AttachErrorKind>>>>,
    default_info: AttachInfo,
    attaches: Arc<Mutex<u32>>,
    detaches: Arc<Mutex<u32>>,
}

impl FakeAttachEngine {
    pub fn with_info(info: AttachInfo) -> Self {
        Self {
            default_info: info,
            ..Self::default()
        }
    }

    pub fn push_response(&self, response: Result<AttachInfo, AttachErrorKind>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response);
    }

    pub fn attaches(&self) -> u32 {
        *self.attaches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn detaches(&self) -> u32 {
        *self.detaches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AttachEngine for FakeAttachEngine {
    fn attach(&self) -> Result<AttachInfo, AttachErrorKind> {
        *self.attaches.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        if responses.is_empty() {
            return Ok(self.default_info.clone());
        }
        responses.remove(0)
    }

    fn detach(&self) {
        *self.detaches.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}
