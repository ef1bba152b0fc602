//! Saving recordings, synchronously or on a background worker.
//!
//! Each retained recording context owns at most one save operation at a
//! time. The worker publishes its state through a `watch` channel and, on
//! completion, writes a single byte to the context's select descriptor if
//! one has been requested.

use crate::errors::{io_err, RecorderError};
use crate::event_log::EventLogSnapshot;
use crate::logging::append_run_log;
use crate::recording::{write_recording, RecordingMetadata, SymbolFileRecord};
use crate::runtime::{Clock, FileSystem};
use serde_json::json;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    /// `0` on success, otherwise the errno describing the failure.
    pub code: i32,
    pub error: Option<String>,
}

impl SaveResult {
    fn from_outcome(outcome: &Result<(), RecorderError>) -> Self {
        match outcome {
            Ok(()) => Self {
                code: 0,
                error: None,
            },
            Err(error) => Self {
                code: error.errno(),
                error: Some(error.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    /// `progress` is a percentage rounded down, or `None` when unknown.
    InProgress { progress: Option<u8> },
    Complete(SaveResult),
}

impl SaveState {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Everything needed to write one recording file.
pub struct SaveJob {
    pub path: PathBuf,
    pub snapshot: Arc<EventLogSnapshot>,
    pub include_symbol_files: bool,
    pub shmem_log: Option<PathBuf>,
    pub fs: Arc<dyn FileSystem>,
    pub clock: Arc<dyn Clock>,
}

impl SaveJob {
    pub fn run(&self, on_progress: &mut dyn FnMut(u8)) -> Result<(), RecorderError> {
        let symbol_files = if self.include_symbol_files {
            self.snapshot
                .attach_info()
                .map(|info| {
                    info.libraries
                        .iter()
                        .map(|lib| SymbolFileRecord::digest(self.fs.as_ref(), lib))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let metadata = RecordingMetadata {
            saved_at_ns: self.clock.now_ns(),
            symbol_files,
            shmem_log: self.shmem_log.clone(),
        };
        write_recording(&self.path, &self.snapshot, &metadata, on_progress)
    }
}

/// Read/write ends of the pipe behind a select descriptor.
struct SelectPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SelectPipe {
    fn new() -> Result<Self, RecorderError> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 fills in.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret != 0 {
            return Err(io_err(std::io::Error::last_os_error()));
        }
        // SAFETY: pipe2 succeeded, so both descriptors are open and owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    /// Consumes any completion byte left over from an earlier save.
    fn drain(&self) {
        let mut buf = [0u8; 16];
        loop {
            // SAFETY: reads into a live local buffer from a non-blocking fd we own.
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 {
                return;
            }
        }
    }

    fn signal(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack value to an fd we own.
        let _ = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                (&byte as *const u8).cast::<libc::c_void>(),
                1,
            )
        };
    }
}

#[derive(Default)]
struct Notifier {
    pipe: Option<SelectPipe>,
}

struct SaveOperation {
    state: watch::Receiver<SaveState>,
    worker: Option<JoinHandle<()>>,
}

/// A stopped-but-retained recording and its save bookkeeping.
pub struct RecordingContext {
    snapshot: Arc<EventLogSnapshot>,
    shmem_log: Option<PathBuf>,
    save: Option<SaveOperation>,
    notifier: Arc<Mutex<Notifier>>,
}

impl RecordingContext {
    pub fn new(snapshot: EventLogSnapshot, shmem_log: Option<PathBuf>) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            shmem_log,
            save: None,
            notifier: Arc::new(Mutex::new(Notifier::default())),
        }
    }

    pub fn snapshot(&self) -> &Arc<EventLogSnapshot> {
        &self.snapshot
    }

    pub fn shmem_log(&self) -> Option<&PathBuf> {
        self.shmem_log.as_ref()
    }

    pub fn is_saving(&self) -> bool {
        self.save
            .as_ref()
            .map(|op| !op.state.borrow().is_complete())
            .unwrap_or(false)
    }

    /// Starts `job` on a worker thread. Rejected while a previous save on
    /// this context is still running; the previous state is left as it was.
    pub fn start_save(&mut self, job: SaveJob) -> Result<(), RecorderError> {
        if self.is_saving() {
            return Err(RecorderError::AlreadyInProgress);
        }
        if let Some(previous) = self.save.as_mut() {
            if let Some(handle) = previous.worker.take() {
                let _ = handle.join();
            }
        }

        // The descriptor turns readable again only when this save completes.
        let notifier_guard = self.notifier.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pipe) = &notifier_guard.pipe {
            pipe.drain();
        }
        let (tx, rx) = watch::channel(SaveState::InProgress { progress: Some(0) });
        let notifier = Arc::clone(&self.notifier);
        let worker = std::thread::Builder::new()
            .name("liverec-save".to_string())
            .spawn(move || run_save_worker(job, tx, notifier))
            .map_err(io_err)?;
        drop(notifier_guard);

        self.save = Some(SaveOperation {
            state: rx,
            worker: Some(worker),
        });
        Ok(())
    }

    pub fn state(&self) -> Result<SaveState, RecorderError> {
        self.save
            .as_ref()
            .map(|op| op.state.borrow().clone())
            .ok_or(RecorderError::SaveNotStarted)
    }

    pub fn subscribe(&self) -> Result<watch::Receiver<SaveState>, RecorderError> {
        self.save
            .as_ref()
            .map(|op| op.state.clone())
            .ok_or(RecorderError::SaveNotStarted)
    }

    /// Read end of the notification pipe, created on first request.
    pub fn select_descriptor(&mut self) -> Result<RawFd, RecorderError> {
        let mut notifier = self.notifier.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pipe) = &notifier.pipe {
            return Ok(pipe.read.as_raw_fd());
        }
        let pipe = SelectPipe::new()?;
        let already_complete = self
            .save
            .as_ref()
            .map(|op| op.state.borrow().is_complete())
            .unwrap_or(false);
        if already_complete {
            pipe.signal();
        }
        let fd = pipe.read.as_raw_fd();
        notifier.pipe = Some(pipe);
        Ok(fd)
    }

    /// Releases the snapshot and closes the select descriptor.
    pub fn discard(mut self) -> Result<(), RecorderError> {
        if self.is_saving() {
            return Err(RecorderError::AlreadyInProgress);
        }
        if let Some(op) = self.save.take() {
            if let Some(handle) = op.worker {
                let _ = handle.join();
            }
        }
        Ok(())
    }
}

fn run_save_worker(job: SaveJob, tx: watch::Sender<SaveState>, notifier: Arc<Mutex<Notifier>>) {
    append_run_log(
        "info",
        "save.async.start",
        json!({ "path": job.path.display().to_string() }),
    );
    let outcome = job.run(&mut |progress| {
        tx.send_replace(SaveState::InProgress {
            progress: Some(progress.min(100)),
        });
    });
    let result = SaveResult::from_outcome(&outcome);
    append_run_log(
        if result.is_success() { "info" } else { "error" },
        "save.async.complete",
        json!({
            "path": job.path.display().to_string(),
            "code": result.code,
            "error": result.error,
        }),
    );

    // Publishing under the notifier lock keeps the pipe byte and the
    // complete state consistent with a concurrent `select_descriptor`.
    let notifier = notifier.lock().unwrap_or_else(PoisonError::into_inner);
    tx.send_replace(SaveState::Complete(result));
    if let Some(pipe) = &notifier.pipe {
        pipe.signal();
    }
}
