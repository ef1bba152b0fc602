//! On-disk format of saved recordings.
//!
//! A recording is a JSONL file where each line is a `RecordEntry`. The first
//! line is always a `Header` and the last a `Trailer`; a file without its
//! trailer was not completely written and is rejected by the loader.

use crate::annotation::Annotation;
use crate::errors::{io_err, RecorderError};
use crate::event_log::{EventLogSnapshot, EventRecord};
use crate::runtime::{AttachInfo, FileSystem};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordEntry {
    Header(HeaderRecord),
    SymbolFile(SymbolFileRecord),
    ShmemLogRef(ShmemLogRefRecord),
    Event(EventRecord),
    Trailer(TrailerRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub format_version: u32,
    pub recorder_version: String,
    pub pid: u32,
    pub saved_at_ns: u64,
    pub event_log_capacity: u64,
    /// Entries dropped from the front of the log before this save.
    pub evicted_events: u64,
    pub next_position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFileRecord {
    pub path: PathBuf,
    pub size: Option<u64>,
    /// Hex SHA-256 of the file contents; `None` when it could not be read.
    pub sha256: Option<String>,
}

impl SymbolFileRecord {
    pub fn digest(fs: &dyn FileSystem, path: &Path) -> Self {
        match fs.read(path) {
            Ok(bytes) => Self {
                path: path.to_path_buf(),
                size: Some(bytes.len() as u64),
                sha256: Some(hex_bytes(&Sha256::digest(&bytes))),
            },
            Err(_) => Self {
                path: path.to_path_buf(),
                size: None,
                sha256: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmemLogRefRecord {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailerRecord {
    pub event_count: u64,
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Everything that goes into one recording file besides the events.
#[derive(Debug, Clone, Default)]
pub struct RecordingMetadata {
    pub saved_at_ns: u64,
    pub symbol_files: Vec<SymbolFileRecord>,
    pub shmem_log: Option<PathBuf>,
}

/// Writes `snapshot` to `path`, reporting percent complete (rounded down)
/// through `on_progress`.
///
/// The file is written to a uniquely named sibling and renamed into place,
/// so `path` either holds a complete recording or is left untouched, even
/// when several saves target the same path at once.
pub fn write_recording(
    path: &Path,
    snapshot: &EventLogSnapshot,
    metadata: &RecordingMetadata,
    on_progress: &mut dyn FnMut(u8),
) -> Result<(), RecorderError> {
    if path.as_os_str().is_empty() {
        return Err(RecorderError::InvalidArgument(
            "recording filename must not be empty".to_string(),
        ));
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    let partial = tempfile::Builder::new()
        .prefix(".liverec-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(io_err)?;
    write_entries(partial.as_file(), snapshot, metadata, on_progress)?;
    partial.persist(path).map_err(|e| io_err(e.error))?;
    on_progress(100);
    Ok(())
}

fn write_entries(
    file: &File,
    snapshot: &EventLogSnapshot,
    metadata: &RecordingMetadata,
    on_progress: &mut dyn FnMut(u8),
) -> Result<(), RecorderError> {
    let mut out = BufWriter::new(file);

    let pid = snapshot.attach_info().map(|info| info.pid).unwrap_or(0);
    write_entry(
        &mut out,
        &RecordEntry::Header(HeaderRecord {
            format_version: FORMAT_VERSION,
            recorder_version: crate::version_string().to_string(),
            pid,
            saved_at_ns: metadata.saved_at_ns,
            event_log_capacity: snapshot.capacity_bytes,
            evicted_events: snapshot.evicted,
            next_position: snapshot.next_position,
        }),
    )?;
    for symbol in &metadata.symbol_files {
        write_entry(&mut out, &RecordEntry::SymbolFile(symbol.clone()))?;
    }
    if let Some(shmem) = &metadata.shmem_log {
        write_entry(
            &mut out,
            &RecordEntry::ShmemLogRef(ShmemLogRefRecord { path: shmem.clone() }),
        )?;
    }

    let total = snapshot.records.len();
    on_progress(0);
    let mut last_reported = 0u8;
    for (index, record) in snapshot.records.iter().enumerate() {
        write_entry(&mut out, &RecordEntry::Event(record.clone()))?;
        let percent = ((index + 1) * 100 / total.max(1)).min(99) as u8;
        if percent > last_reported {
            last_reported = percent;
            on_progress(percent);
        }
    }
    write_entry(
        &mut out,
        &RecordEntry::Trailer(TrailerRecord {
            event_count: total as u64,
        }),
    )?;
    let file = out
        .into_inner()
        .map_err(|e| RecorderError::Io(e.to_string()))?;
    file.sync_all().map_err(io_err)
}

fn write_entry(out: &mut impl Write, entry: &RecordEntry) -> Result<(), RecorderError> {
    let line = serde_json::to_string(entry).map_err(|e| RecorderError::Io(e.to_string()))?;
    writeln!(out, "{line}").map_err(io_err)
}

/// A recording file loaded back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRecording {
    pub header: HeaderRecord,
    pub symbol_files: Vec<SymbolFileRecord>,
    pub shmem_log: Option<PathBuf>,
    pub events: Vec<EventRecord>,
}

impl LoadedRecording {
    pub fn load(path: &Path) -> Result<Self, RecorderError> {
        let file = File::open(path).map_err(io_err)?;
        let mut header = None;
        let mut symbol_files = Vec::new();
        let mut shmem_log = None;
        let mut events = Vec::new();
        let mut trailer = None;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            if trailer.is_some() {
                return Err(corrupt(path, "data after trailer"));
            }
            let entry: RecordEntry = serde_json::from_str(&line)
                .map_err(|e| corrupt(path, &format!("line {}: {e}", index + 1)))?;
            match entry {
                RecordEntry::Header(h) if header.is_none() && index == 0 => header = Some(h),
                RecordEntry::Header(_) => return Err(corrupt(path, "unexpected header")),
                _ if header.is_none() => return Err(corrupt(path, "missing header")),
                RecordEntry::SymbolFile(symbol) => symbol_files.push(symbol),
                RecordEntry::ShmemLogRef(shmem) => shmem_log = Some(shmem.path),
                RecordEntry::Event(event) => events.push(event),
                RecordEntry::Trailer(t) => trailer = Some(t),
            }
        }

        let header = header.ok_or_else(|| corrupt(path, "missing header"))?;
        let trailer = trailer.ok_or_else(|| corrupt(path, "missing trailer (incomplete save)"))?;
        if trailer.event_count != events.len() as u64 {
            return Err(corrupt(
                path,
                &format!(
                    "trailer counts {} events but {} were read",
                    trailer.event_count,
                    events.len()
                ),
            ));
        }
        if header.format_version != FORMAT_VERSION {
            return Err(corrupt(
                path,
                &format!("unsupported format version {}", header.format_version),
            ));
        }
        Ok(Self {
            header,
            symbol_files,
            shmem_log,
            events,
        })
    }

    pub fn annotations(&self) -> impl Iterator<Item = (u64, &Annotation)> {
        self.events.iter().filter_map(|record| match &record.event {
            crate::event_log::Event::Annotation(annotation) => Some((record.position, annotation)),
            _ => None,
        })
    }

    pub fn annotations_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Annotation> + 'a {
        self.annotations()
            .map(|(_, annotation)| annotation)
            .filter(move |annotation| annotation.name == name)
    }

    pub fn attach_info(&self) -> Option<&AttachInfo> {
        self.events.iter().find_map(|record| match &record.event {
            crate::event_log::Event::SessionStarted(info) => Some(info),
            _ => None,
        })
    }
}

fn corrupt(path: &Path, reason: &str) -> RecorderError {
    RecorderError::InvalidArgument(format!(
        "{} is not a valid recording: {reason}",
        path.display()
    ))
}
