//! Process-wide recorder.
//!
//! Instrumented programs call the free functions here instead of threading a
//! `Recorder` through their code. When no recorder has been installed every
//! call reports `NotSupported`, the same as a build without the engine.

use crate::annotation::ContentType;
use crate::errors::RecorderError;
use crate::logging::append_run_log;
use crate::save::{SaveResult, SaveState};
use crate::session::{Recorder, RecordingContextHandle, TestAnnotationHandle};
use crate::shmem::ShmemAccess;
use crate::test_annotation::TestResult;
use serde_json::json;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::watch;

static RECORDER: OnceLock<Mutex<Option<Arc<Recorder>>>> = OnceLock::new();
static EXIT_HOOK: OnceLock<()> = OnceLock::new();

fn recorder_slot() -> &'static Mutex<Option<Arc<Recorder>>> {
    RECORDER.get_or_init(|| Mutex::new(None))
}

pub fn install_recorder(recorder: Arc<Recorder>) {
    *recorder_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(recorder);
}

pub fn clear_recorder() {
    *recorder_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

pub fn current() -> Option<Arc<Recorder>> {
    recorder_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn with_recorder<T>(
    op: impl FnOnce(&Recorder) -> Result<T, RecorderError>,
) -> Result<T, RecorderError> {
    let recorder = current().ok_or_else(|| {
        RecorderError::NotSupported("no recorder is installed in this process".to_string())
    })?;
    op(&recorder)
}

extern "C" fn run_termination_save_at_exit() {
    let Some(recorder) = current() else {
        return;
    };
    if let Err(error) = recorder.run_termination_save() {
        append_run_log(
            "error",
            "save.on_termination.failed",
            json!({ "error": error.to_string() }),
        );
    }
}

/// Registers an `atexit` handler that performs any pending save-on-termination.
/// Registering more than once has no further effect.
pub fn install_exit_hook() -> Result<(), RecorderError> {
    let mut outcome = Ok(());
    EXIT_HOOK.get_or_init(|| {
        // SAFETY: the handler is a plain `extern "C"` function with no captured state.
        let ret = unsafe { libc::atexit(run_termination_save_at_exit) };
        if ret != 0 {
            outcome = Err(RecorderError::Io(
                "failed to register exit handler".to_string(),
            ));
        }
    });
    outcome
}

pub fn start() -> Result<(), RecorderError> {
    with_recorder(Recorder::start)
}

pub fn stop(retain: bool) -> Result<Option<RecordingContextHandle>, RecorderError> {
    with_recorder(|r| r.stop(retain))
}

pub fn current_position() -> Result<u64, RecorderError> {
    with_recorder(Recorder::current_position)
}

pub fn record_execution(thread_id: u64, detail: &str) -> Result<u64, RecorderError> {
    with_recorder(|r| r.record_execution(thread_id, detail))
}

pub fn record_shmem_access(access: ShmemAccess) -> Result<bool, RecorderError> {
    with_recorder(|r| r.record_shmem_access(access))
}

pub fn save(filename: impl AsRef<Path>) -> Result<(), RecorderError> {
    with_recorder(|r| r.save(filename))
}

pub fn save_async(
    context: RecordingContextHandle,
    filename: impl AsRef<Path>,
) -> Result<(), RecorderError> {
    with_recorder(|r| r.save_async(context, filename))
}

pub fn poll_saving_complete(
    context: RecordingContextHandle,
) -> Result<Option<SaveResult>, RecorderError> {
    with_recorder(|r| r.poll_saving_complete(context))
}

pub fn poll_saving_progress(context: RecordingContextHandle) -> Result<SaveState, RecorderError> {
    with_recorder(|r| r.poll_saving_progress(context))
}

pub fn get_select_descriptor(context: RecordingContextHandle) -> Result<RawFd, RecorderError> {
    with_recorder(|r| r.get_select_descriptor(context))
}

pub fn wait_for_save(
    context: RecordingContextHandle,
) -> Result<watch::Receiver<SaveState>, RecorderError> {
    with_recorder(|r| r.wait_for_save(context))
}

pub fn discard(context: RecordingContextHandle) -> Result<(), RecorderError> {
    with_recorder(|r| r.discard(context))
}

/// Registers a save-on-termination with the installed recorder and makes
/// sure the exit hook that performs it is in place.
pub fn save_on_termination(filename: impl AsRef<Path>) -> Result<(), RecorderError> {
    install_exit_hook()?;
    with_recorder(|r| r.save_on_termination(filename))
}

pub fn save_on_termination_cancel() -> Result<(), RecorderError> {
    with_recorder(Recorder::save_on_termination_cancel)
}

pub fn run_termination_save() -> Result<Option<PathBuf>, RecorderError> {
    with_recorder(Recorder::run_termination_save)
}

pub fn event_log_size_set(bytes: i64) -> Result<(), RecorderError> {
    with_recorder(|r| r.event_log_size_set(bytes))
}

pub fn event_log_size_get() -> Result<i64, RecorderError> {
    with_recorder(Recorder::event_log_size_get)
}

pub fn include_symbol_files(include: bool) -> Result<(), RecorderError> {
    with_recorder(|r| r.include_symbol_files(include))
}

pub fn shmem_log_filename_set(filename: Option<&Path>) -> Result<(), RecorderError> {
    with_recorder(|r| r.shmem_log_filename_set(filename))
}

pub fn shmem_log_filename_get() -> Result<Option<PathBuf>, RecorderError> {
    with_recorder(Recorder::shmem_log_filename_get)
}

pub fn shmem_log_size_set(max_size: u64) -> Result<(), RecorderError> {
    with_recorder(|r| r.shmem_log_size_set(max_size))
}

pub fn shmem_log_size_get() -> Result<u64, RecorderError> {
    with_recorder(Recorder::shmem_log_size_get)
}

pub fn recording_start() -> Result<(), RecorderError> {
    with_recorder(Recorder::recording_start)
}

pub fn recording_stop() -> Result<(), RecorderError> {
    with_recorder(Recorder::recording_stop)
}

pub fn recording_stop_and_save(
    filename: impl AsRef<Path>,
) -> Result<RecordingContextHandle, RecorderError> {
    with_recorder(|r| r.recording_stop_and_save(filename))
}

pub fn annotation_add_raw_data(
    name: &str,
    detail: Option<&str>,
    raw_data: Option<&[u8]>,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.annotation_add_raw_data(name, detail, raw_data))
}

pub fn annotation_add_text(
    name: &str,
    detail: Option<&str>,
    content_type: ContentType,
    text: Option<&str>,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.annotation_add_text(name, detail, content_type, text))
}

pub fn annotation_add_int(name: &str, detail: Option<&str>, value: i64) -> Result<u64, RecorderError> {
    with_recorder(|r| r.annotation_add_int(name, detail, value))
}

pub fn test_annotation_new(
    base_test_name: &str,
    add_run_suffix: bool,
) -> Result<TestAnnotationHandle, RecorderError> {
    with_recorder(|r| r.test_annotation_new(base_test_name, add_run_suffix))
}

pub fn test_annotation_free(test: TestAnnotationHandle) -> Result<(), RecorderError> {
    with_recorder(|r| r.test_annotation_free(test))
}

pub fn test_annotation_start(test: TestAnnotationHandle) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_start(test))
}

pub fn test_annotation_end(test: TestAnnotationHandle) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_end(test))
}

pub fn test_annotation_set_result(
    test: TestAnnotationHandle,
    result: TestResult,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_set_result(test, result))
}

pub fn test_annotation_set_output(
    test: TestAnnotationHandle,
    content_type: ContentType,
    output: &str,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_set_output(test, content_type, output))
}

pub fn test_annotation_add_raw_data(
    test: TestAnnotationHandle,
    detail: &str,
    raw_data: Option<&[u8]>,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_add_raw_data(test, detail, raw_data))
}

pub fn test_annotation_add_text(
    test: TestAnnotationHandle,
    detail: &str,
    content_type: ContentType,
    text: Option<&str>,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_add_text(test, detail, content_type, text))
}

pub fn test_annotation_add_int(
    test: TestAnnotationHandle,
    detail: &str,
    value: i64,
) -> Result<u64, RecorderError> {
    with_recorder(|r| r.test_annotation_add_int(test, detail, value))
}
