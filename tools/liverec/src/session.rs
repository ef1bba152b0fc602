//! Recording session controller.
//!
//! `Recorder` owns the whole control plane for one process: configuration,
//! the active session (if any), retained recording contexts and test
//! annotations. All of that lives behind a single mutex; the only work done
//! outside it is file I/O for saves.

use crate::annotation::{AnnotationContent, AnnotationRequest, ContentType};
use crate::arena::{Arena, Handle};
use crate::config::RecorderConfig;
use crate::errors::RecorderError;
use crate::event_log::{Event, EventLogStore};
use crate::logging::append_run_log;
use crate::runtime::{AttachEngine, Clock, FileSystem, ProductionClock, ProductionFileSystem};
use crate::save::{RecordingContext, SaveJob, SaveResult, SaveState};
use crate::shmem::{validate_shmem_filename, ShmemAccess, ShmemLogConfig, ShmemLogWriter};
use crate::test_annotation::{TestAnnotation, TestNamer, TestResult};
use serde_json::json;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Handle to a stopped-but-retained recording, valid until discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordingContextHandle(Handle);

/// Handle to a test annotation, valid until freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestAnnotationHandle(Handle);

struct ActiveSession {
    log: EventLogStore,
    shmem: Option<ShmemLogWriter>,
    termination_save: Option<PathBuf>,
}

struct RecorderState {
    event_log_size: u64,
    include_symbol_files: bool,
    shmem: ShmemLogConfig,
    session: Option<ActiveSession>,
    detached: bool,
    contexts: Arena<RecordingContext>,
    tests: Arena<TestAnnotation>,
    namer: TestNamer,
}

pub struct Recorder {
    engine: Option<Arc<dyn AttachEngine>>,
    clock: Arc<dyn Clock>,
    fs: Arc<dyn FileSystem>,
    state: Mutex<RecorderState>,
}

impl Recorder {
    /// Without an engine every operation fails with `NotSupported`.
    pub fn new(config: &RecorderConfig, engine: Option<Arc<dyn AttachEngine>>) -> Self {
        Self::with_runtime(
            config,
            engine,
            Arc::new(ProductionClock),
            Arc::new(ProductionFileSystem),
        )
    }

    pub fn with_runtime(
        config: &RecorderConfig,
        engine: Option<Arc<dyn AttachEngine>>,
        clock: Arc<dyn Clock>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            engine,
            clock,
            fs,
            state: Mutex::new(RecorderState {
                event_log_size: config.event_log.size_bytes,
                include_symbol_files: config.save.include_symbol_files,
                shmem: config.shmem_log_config(),
                session: None,
                detached: false,
                contexts: Arena::default(),
                tests: Arena::default(),
                namer: TestNamer::default(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecorderState>, RecorderError> {
        if self.engine.is_none() {
            return Err(RecorderError::NotSupported(
                "no recording engine is available".to_string(),
            ));
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn engine(&self) -> Result<&Arc<dyn AttachEngine>, RecorderError> {
        self.engine.as_ref().ok_or_else(|| {
            RecorderError::NotSupported("no recording engine is available".to_string())
        })
    }

    // ── Session lifecycle ────────────────────────────────────────────────────

    /// Starts recording the current process.
    ///
    /// On failure nothing changes: no session exists, the engine is left
    /// detached, and no shared-memory log is opened.
    pub fn start(&self) -> Result<(), RecorderError> {
        let mut state = self.lock()?;
        let engine = self.engine()?;
        if state.detached {
            return Err(RecorderError::Detached);
        }
        if state.session.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }

        let info = engine.attach().map_err(|kind| {
            append_run_log(
                "error",
                "session.attach_failed",
                json!({ "code": kind.code(), "reason": kind.describe() }),
            );
            RecorderError::Attach(kind)
        })?;
        let shmem = match ShmemLogWriter::open(&state.shmem, Arc::clone(&self.clock)) {
            Ok(writer) => writer,
            Err(error) => {
                engine.detach();
                return Err(error);
            }
        };

        let mut log = EventLogStore::with_capacity(state.event_log_size);
        append_run_log(
            "info",
            "session.start",
            json!({
                "pid": info.pid,
                "threads": info.threads.len(),
                "event_log_size": state.event_log_size,
                "shmem_log": shmem.as_ref().map(|w| w.path().display().to_string()),
            }),
        );
        log.append(self.clock.now_ns(), Event::SessionStarted(info));
        state.session = Some(ActiveSession {
            log,
            shmem,
            termination_save: None,
        });
        Ok(())
    }

    /// Stops recording. With `retain` the captured history is handed back as
    /// a context that must eventually be passed to `discard`; otherwise it is
    /// dropped immediately.
    pub fn stop(&self, retain: bool) -> Result<Option<RecordingContextHandle>, RecorderError> {
        let mut state = self.lock()?;
        let session = state.session.take().ok_or(RecorderError::NotRecording)?;
        self.engine()?.detach();

        let shmem_log = session.shmem.as_ref().map(|w| w.path().to_path_buf());
        let snapshot = session.log.into_snapshot();
        append_run_log(
            "info",
            "session.stop",
            json!({
                "retain": retain,
                "events": snapshot.records.len(),
                "next_position": snapshot.next_position,
            }),
        );
        if !retain {
            return Ok(None);
        }
        let handle = state
            .contexts
            .insert(RecordingContext::new(snapshot, shmem_log));
        Ok(Some(RecordingContextHandle(handle)))
    }

    pub fn is_recording(&self) -> Result<bool, RecorderError> {
        Ok(self.lock()?.session.is_some())
    }

    /// Position the next event of the active session will be recorded at.
    pub fn current_position(&self) -> Result<u64, RecorderError> {
        let state = self.lock()?;
        let session = state.session.as_ref().ok_or(RecorderError::NotRecording)?;
        Ok(session.log.current_position())
    }

    /// Appends an execution event on behalf of the instrumentation.
    pub fn record_execution(&self, thread_id: u64, detail: &str) -> Result<u64, RecorderError> {
        let mut state = self.lock()?;
        let session = state.session.as_mut().ok_or(RecorderError::NotRecording)?;
        Ok(session.log.append(
            self.clock.now_ns(),
            Event::Execution {
                thread_id,
                detail: detail.to_string(),
            },
        ))
    }

    /// Logs a shared-memory access. `Ok(false)` means the access was not
    /// written: either no shared-memory log is configured or it is full.
    pub fn record_shmem_access(&self, access: ShmemAccess) -> Result<bool, RecorderError> {
        let mut state = self.lock()?;
        let session = state.session.as_mut().ok_or(RecorderError::NotRecording)?;
        match session.shmem.as_mut() {
            Some(writer) => writer.append(access),
            None => Ok(false),
        }
    }

    // ── Saving ───────────────────────────────────────────────────────────────

    /// Saves the live session's history so far. Each call produces an
    /// independent recording; recording carries on unaffected.
    pub fn save(&self, filename: impl AsRef<Path>) -> Result<(), RecorderError> {
        let job = {
            let state = self.lock()?;
            let session = state.session.as_ref().ok_or(RecorderError::NotRecording)?;
            self.save_job(
                filename.as_ref(),
                Arc::new(session.log.snapshot()),
                state.include_symbol_files,
                session.shmem.as_ref().map(|w| w.path().to_path_buf()),
            )
        };
        let outcome = job.run(&mut |_| {});
        append_run_log(
            if outcome.is_ok() { "info" } else { "error" },
            "save.sync",
            json!({
                "path": filename.as_ref().display().to_string(),
                "error": outcome.as_ref().err().map(ToString::to_string),
            }),
        );
        outcome
    }

    fn save_job(
        &self,
        path: &Path,
        snapshot: Arc<crate::event_log::EventLogSnapshot>,
        include_symbol_files: bool,
        shmem_log: Option<PathBuf>,
    ) -> SaveJob {
        SaveJob {
            path: path.to_path_buf(),
            snapshot,
            include_symbol_files,
            shmem_log,
            fs: Arc::clone(&self.fs),
            clock: Arc::clone(&self.clock),
        }
    }

    pub fn save_async(
        &self,
        context: RecordingContextHandle,
        filename: impl AsRef<Path>,
    ) -> Result<(), RecorderError> {
        if filename.as_ref().as_os_str().is_empty() {
            return Err(RecorderError::InvalidArgument(
                "recording filename must not be empty".to_string(),
            ));
        }
        let mut state = self.lock()?;
        let include_symbol_files = state.include_symbol_files;
        let ctx = state.contexts.get_mut(context.0)?;
        if ctx.is_saving() {
            return Err(RecorderError::AlreadyInProgress);
        }
        let job = self.save_job(
            filename.as_ref(),
            Arc::clone(ctx.snapshot()),
            include_symbol_files,
            ctx.shmem_log().cloned(),
        );
        ctx.start_save(job)
    }

    /// `None` while the save is running, then the (unchanging) result.
    pub fn poll_saving_complete(
        &self,
        context: RecordingContextHandle,
    ) -> Result<Option<SaveResult>, RecorderError> {
        match self.poll_saving_progress(context)? {
            SaveState::InProgress { .. } => Ok(None),
            SaveState::Complete(result) => Ok(Some(result)),
        }
    }

    pub fn poll_saving_progress(
        &self,
        context: RecordingContextHandle,
    ) -> Result<SaveState, RecorderError> {
        let state = self.lock()?;
        state.contexts.get(context.0)?.state()
    }

    /// Descriptor that becomes readable (one byte) when the save completes.
    /// It is closed by `discard`.
    pub fn get_select_descriptor(
        &self,
        context: RecordingContextHandle,
    ) -> Result<RawFd, RecorderError> {
        let mut state = self.lock()?;
        state.contexts.get_mut(context.0)?.select_descriptor()
    }

    /// Receiver that observes every state change of the current save.
    pub fn wait_for_save(
        &self,
        context: RecordingContextHandle,
    ) -> Result<watch::Receiver<SaveState>, RecorderError> {
        let state = self.lock()?;
        state.contexts.get(context.0)?.subscribe()
    }

    /// Frees a retained recording. Rejected while a save is still running.
    pub fn discard(&self, context: RecordingContextHandle) -> Result<(), RecorderError> {
        let mut state = self.lock()?;
        if state.contexts.get(context.0)?.is_saving() {
            return Err(RecorderError::AlreadyInProgress);
        }
        let ctx = state.contexts.remove(context.0)?;
        ctx.discard()?;
        append_run_log(
            "info",
            "context.discard",
            json!({ "live_contexts": state.contexts.len() }),
        );
        Ok(())
    }

    // ── Save on termination ──────────────────────────────────────────────────

    /// Registers `filename` to be saved when the process exits. The save
    /// itself happens in `run_termination_save`, which the exit hook from
    /// `global::install_exit_hook` calls; the global `save_on_termination`
    /// installs that hook. A recorder used outside the global slot must call
    /// `run_termination_save` itself.
    pub fn save_on_termination(&self, filename: impl AsRef<Path>) -> Result<(), RecorderError> {
        let mut state = self.lock()?;
        let session = state.session.as_mut().ok_or(RecorderError::NotRecording)?;
        if filename.as_ref().as_os_str().is_empty() {
            return Err(RecorderError::InvalidArgument(
                "recording filename must not be empty".to_string(),
            ));
        }
        session.termination_save = Some(filename.as_ref().to_path_buf());
        Ok(())
    }

    pub fn save_on_termination_cancel(&self) -> Result<(), RecorderError> {
        let mut state = self.lock()?;
        if let Some(session) = state.session.as_mut() {
            session.termination_save = None;
        }
        Ok(())
    }

    pub fn termination_save_target(&self) -> Result<Option<PathBuf>, RecorderError> {
        let state = self.lock()?;
        Ok(state
            .session
            .as_ref()
            .and_then(|session| session.termination_save.clone()))
    }

    /// Performs the registered save-on-termination, if any, and returns the
    /// path written. The registration is consumed.
    pub fn run_termination_save(&self) -> Result<Option<PathBuf>, RecorderError> {
        let job = {
            let mut state = self.lock()?;
            let include_symbol_files = state.include_symbol_files;
            let Some(session) = state.session.as_mut() else {
                return Ok(None);
            };
            let Some(path) = session.termination_save.take() else {
                return Ok(None);
            };
            self.save_job(
                &path,
                Arc::new(session.log.snapshot()),
                include_symbol_files,
                session.shmem.as_ref().map(|w| w.path().to_path_buf()),
            )
        };
        job.run(&mut |_| {})?;
        append_run_log(
            "info",
            "save.on_termination",
            json!({ "path": job.path.display().to_string() }),
        );
        Ok(Some(job.path))
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Sets the event log size used by the next session.
    pub fn event_log_size_set(&self, bytes: i64) -> Result<(), RecorderError> {
        if bytes <= 0 {
            return Err(RecorderError::InvalidArgument(format!(
                "event log size must be positive, got {bytes}"
            )));
        }
        self.lock()?.event_log_size = bytes as u64;
        Ok(())
    }

    pub fn event_log_size_get(&self) -> Result<i64, RecorderError> {
        Ok(self.lock()?.event_log_size as i64)
    }

    pub fn include_symbol_files(&self, include: bool) -> Result<(), RecorderError> {
        self.lock()?.include_symbol_files = include;
        Ok(())
    }

    pub fn includes_symbol_files(&self) -> Result<bool, RecorderError> {
        Ok(self.lock()?.include_symbol_files)
    }

    /// Sets (or with `None` clears) the shared-memory access log. Only
    /// allowed before recording starts.
    pub fn shmem_log_filename_set(&self, filename: Option<&Path>) -> Result<(), RecorderError> {
        let mut state = self.lock()?;
        if state.session.is_some() {
            return Err(RecorderError::InvalidArgument(
                "shared memory log must be configured before recording starts".to_string(),
            ));
        }
        if let Some(path) = filename {
            validate_shmem_filename(path)?;
        }
        state.shmem.filename = filename.map(Path::to_path_buf);
        Ok(())
    }

    pub fn shmem_log_filename_get(&self) -> Result<Option<PathBuf>, RecorderError> {
        Ok(self.lock()?.shmem.filename.clone())
    }

    /// Sets the maximum shared-memory log size; `0` selects the default.
    pub fn shmem_log_size_set(&self, max_size: u64) -> Result<(), RecorderError> {
        let mut state = self.lock()?;
        if state.session.is_some() {
            return Err(RecorderError::InvalidArgument(
                "shared memory log size must be set before recording starts".to_string(),
            ));
        }
        state.shmem.max_size_bytes = max_size;
        Ok(())
    }

    pub fn shmem_log_size_get(&self) -> Result<u64, RecorderError> {
        Ok(self.lock()?.shmem.max_size_bytes)
    }

    // ── Legacy entry points ──────────────────────────────────────────────────

    /// Like `start`, but succeeds when already recording.
    pub fn recording_start(&self) -> Result<(), RecorderError> {
        match self.start() {
            Err(RecorderError::AlreadyRecording) => Ok(()),
            other => other,
        }
    }

    pub fn recording_stop(&self) -> Result<(), RecorderError> {
        self.stop(false).map(|_| ())
    }

    /// Stops recording, saves asynchronously to `filename`, and detaches for
    /// good: later calls to `start` fail with `Detached`. The context is
    /// returned so the caller can poll and discard it. If the save cannot be
    /// started the context is discarded and the recorder is not detached.
    pub fn recording_stop_and_save(
        &self,
        filename: impl AsRef<Path>,
    ) -> Result<RecordingContextHandle, RecorderError> {
        let context = self.stop(true)?.ok_or(RecorderError::NotRecording)?;
        if let Err(error) = self.save_async(context, filename) {
            // Nothing was handed to the caller, so the context is freed and
            // the recorder stays restartable.
            let _ = self.lock()?.contexts.remove(context.0);
            return Err(error);
        }
        self.lock()?.detached = true;
        Ok(context)
    }

    // ── Annotations ──────────────────────────────────────────────────────────

    fn append_annotation(&self, request: AnnotationRequest) -> Result<u64, RecorderError> {
        let mut state = self.lock()?;
        let session = state.session.as_mut().ok_or(RecorderError::NotRecording)?;
        Ok(session
            .log
            .append(self.clock.now_ns(), Event::Annotation(request.into())))
    }

    pub fn annotation_add_raw_data(
        &self,
        name: &str,
        detail: Option<&str>,
        raw_data: Option<&[u8]>,
    ) -> Result<u64, RecorderError> {
        let request = AnnotationRequest::user(name, detail, AnnotationContent::raw(raw_data))?;
        self.append_annotation(request)
    }

    pub fn annotation_add_text(
        &self,
        name: &str,
        detail: Option<&str>,
        content_type: ContentType,
        text: Option<&str>,
    ) -> Result<u64, RecorderError> {
        let content = AnnotationContent::text(content_type, text)?;
        let request = AnnotationRequest::user(name, detail, content)?;
        self.append_annotation(request)
    }

    pub fn annotation_add_int(
        &self,
        name: &str,
        detail: Option<&str>,
        value: i64,
    ) -> Result<u64, RecorderError> {
        let request = AnnotationRequest::user(name, detail, AnnotationContent::Int { value })?;
        self.append_annotation(request)
    }

    // ── Test annotations ─────────────────────────────────────────────────────

    /// Creates a test annotation. Works whether or not a session is active.
    pub fn test_annotation_new(
        &self,
        base_test_name: &str,
        add_run_suffix: bool,
    ) -> Result<TestAnnotationHandle, RecorderError> {
        let mut state = self.lock()?;
        let test = state.namer.create(base_test_name, add_run_suffix)?;
        Ok(TestAnnotationHandle(state.tests.insert(test)))
    }

    pub fn test_annotation_free(&self, test: TestAnnotationHandle) -> Result<(), RecorderError> {
        self.lock()?.tests.remove(test.0).map(|_| ())
    }

    pub fn test_annotation_name(&self, test: TestAnnotationHandle) -> Result<String, RecorderError> {
        Ok(self.lock()?.tests.get(test.0)?.test_name().to_string())
    }

    /// Emits the annotation built by `build` for `test`, then lets `after`
    /// update the test's bookkeeping once it is in the log.
    fn emit_test_annotation(
        &self,
        test: TestAnnotationHandle,
        build: impl FnOnce(&TestAnnotation) -> Result<AnnotationRequest, RecorderError>,
        after: impl FnOnce(&mut TestAnnotation),
    ) -> Result<u64, RecorderError> {
        let mut state = self.lock()?;
        let now = self.clock.now_ns();
        let request = build(state.tests.get(test.0)?)?;
        let session = state.session.as_mut().ok_or(RecorderError::NotRecording)?;
        let position = session.log.append(now, Event::Annotation(request.into()));
        after(state.tests.get_mut(test.0)?);
        Ok(position)
    }

    pub fn test_annotation_start(&self, test: TestAnnotationHandle) -> Result<u64, RecorderError> {
        self.emit_test_annotation(test, |t| Ok(t.start()), TestAnnotation::mark_started)
    }

    pub fn test_annotation_end(&self, test: TestAnnotationHandle) -> Result<u64, RecorderError> {
        self.emit_test_annotation(test, |t| Ok(t.end()), TestAnnotation::mark_ended)
    }

    pub fn test_annotation_set_result(
        &self,
        test: TestAnnotationHandle,
        result: TestResult,
    ) -> Result<u64, RecorderError> {
        self.emit_test_annotation(test, |t| Ok(t.result(result)), |_| {})
    }

    pub fn test_annotation_set_output(
        &self,
        test: TestAnnotationHandle,
        content_type: ContentType,
        output: &str,
    ) -> Result<u64, RecorderError> {
        self.emit_test_annotation(test, |t| t.output(content_type, output), |_| {})
    }

    pub fn test_annotation_add_raw_data(
        &self,
        test: TestAnnotationHandle,
        detail: &str,
        raw_data: Option<&[u8]>,
    ) -> Result<u64, RecorderError> {
        self.emit_test_annotation(
            test,
            |t| t.custom(detail, AnnotationContent::raw(raw_data)),
            |_| {},
        )
    }

    pub fn test_annotation_add_text(
        &self,
        test: TestAnnotationHandle,
        detail: &str,
        content_type: ContentType,
        text: Option<&str>,
    ) -> Result<u64, RecorderError> {
        self.emit_test_annotation(
            test,
            |t| t.custom(detail, AnnotationContent::text(content_type, text)?),
            |_| {},
        )
    }

    pub fn test_annotation_add_int(
        &self,
        test: TestAnnotationHandle,
        detail: &str,
        value: i64,
    ) -> Result<u64, RecorderError> {
        self.emit_test_annotation(
            test,
            |t| t.custom(detail, AnnotationContent::Int { value }),
            |_| {},
        )
    }

    pub fn test_annotation_state(
        &self,
        test: TestAnnotationHandle,
    ) -> Result<(bool, bool), RecorderError> {
        let state = self.lock()?;
        let test = state.tests.get(test.0)?;
        Ok((test.started(), test.ended()))
    }

    /// Number of retained contexts not yet discarded.
    pub fn live_contexts(&self) -> Result<usize, RecorderError> {
        Ok(self.lock()?.contexts.len())
    }
}
