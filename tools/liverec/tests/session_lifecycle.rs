use liverec::annotation::{AnnotationContent, ContentType};
use liverec::config::RecorderConfig;
use liverec::errors::RecorderError;
use liverec::recording::LoadedRecording;
use liverec::runtime::{AttachInfo, FakeAttachEngine, FakeClock, FileSystem, ProductionFileSystem};
use liverec::save::SaveState;
use liverec::session::{Recorder, RecordingContextHandle};
use liverec::shmem::{read_shmem_log, AccessKind, ShmemAccess};
use liverec::test_annotation::{TestResult, DETAIL_TEST_RESULT, DETAIL_TEST_START};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ── helpers ───────────────────────────────────────────────────────────────────

fn engine() -> FakeAttachEngine {
    FakeAttachEngine::with_info(AttachInfo {
        pid: 77,
        threads: vec![77, 78],
        libraries: vec![],
    })
}

fn recorder_with(engine: FakeAttachEngine, fs: Arc<dyn FileSystem>) -> Recorder {
    Recorder::with_runtime(
        &RecorderConfig::default(),
        Some(Arc::new(engine)),
        Arc::new(FakeClock::default()),
        fs,
    )
}

fn recorder() -> Recorder {
    recorder_with(engine(), Arc::new(ProductionFileSystem))
}

fn wait_complete(recorder: &Recorder, context: RecordingContextHandle) -> liverec::save::SaveResult {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(result) = recorder.poll_saving_complete(context).expect("poll") {
            return result;
        }
        assert!(Instant::now() < deadline, "save did not complete");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn counter_values(path: &Path) -> Vec<i64> {
    LoadedRecording::load(path)
        .expect("loadable")
        .annotations_named("counter")
        .map(|annotation| match annotation.content {
            AnnotationContent::Int { value } => value,
            ref other => panic!("unexpected content {other:?}"),
        })
        .collect()
}

/// File system whose reads block until released, so a save can be held
/// in flight for as long as a test needs.
struct GatedFileSystem {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl FileSystem for GatedFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RecorderError> {
        ProductionFileSystem.read_to_string(path)
    }

    fn read(&self, _path: &Path) -> Result<Vec<u8>, RecorderError> {
        let _ = self.entered.lock().expect("lock").send(());
        let _ = self.release.lock().expect("lock").recv();
        Ok(b"library".to_vec())
    }
}

// ── scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn incremental_saves_capture_history_so_far() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    let run1 = dir.path().join("run1.rec");
    let run2 = dir.path().join("run2.rec");

    recorder.start().expect("start");
    recorder
        .annotation_add_int("counter", Some("tick"), 5)
        .expect("annotate 5");
    recorder.save(&run1).expect("save run1");
    recorder
        .annotation_add_int("counter", Some("tick"), 6)
        .expect("annotate 6");
    recorder.save(&run2).expect("save run2");
    assert_eq!(recorder.stop(false), Ok(None));

    assert_eq!(counter_values(&run1), vec![5]);
    assert_eq!(counter_values(&run2), vec![5, 6]);
}

#[test]
fn json_annotation_payload_survives_save() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    let payload = r#"{"k": [1, 2, "três"], "nested": {"x": null}}"#;
    let path = dir.path().join("json.rec");

    recorder.start().expect("start");
    recorder
        .annotation_add_text("payload", Some("body"), ContentType::Json, Some(payload))
        .expect("annotate");
    recorder
        .annotation_add_raw_data("blob", None, Some(&[0, 255, 10, 13]))
        .expect("raw");
    recorder.save(&path).expect("save");
    recorder.stop(false).expect("stop");

    let loaded = LoadedRecording::load(&path).expect("load");
    let annotations: Vec<_> = loaded.annotations().map(|(_, a)| a.clone()).collect();
    assert_eq!(annotations.len(), 2);
    assert_eq!(annotations[0].detail, "body");
    assert_eq!(
        annotations[0].content,
        AnnotationContent::Text {
            content_type: ContentType::Json,
            text: payload.to_string(),
        }
    );
    assert_eq!(annotations[1].detail, "");
    assert_eq!(
        annotations[1].content,
        AnnotationContent::Raw {
            bytes: vec![0, 255, 10, 13]
        }
    );
    assert_eq!(loaded.attach_info().map(|info| info.pid), Some(77));
}

#[test]
fn identical_annotations_are_kept_separately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.start().expect("start");
    let first = recorder.annotation_add_int("dup", Some("d"), 1).expect("first");
    let second = recorder.annotation_add_int("dup", Some("d"), 1).expect("second");
    assert!(second > first);
    let path = dir.path().join("dup.rec");
    recorder.save(&path).expect("save");
    assert_eq!(
        LoadedRecording::load(&path)
            .expect("load")
            .annotations_named("dup")
            .count(),
        2
    );
}

#[test]
fn annotations_require_active_session_and_valid_names() {
    let recorder = recorder();
    assert_eq!(
        recorder.annotation_add_int("counter", None, 1),
        Err(RecorderError::NotRecording)
    );
    recorder.start().expect("start");
    for bad in ["", "u-internal"] {
        assert!(matches!(
            recorder.annotation_add_int(bad, None, 1),
            Err(RecorderError::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        recorder.annotation_add_text("t", None, ContentType::UnstructuredText, Some("a\0b")),
        Err(RecorderError::InvalidArgument(_))
    ));
}

#[test]
fn discarded_context_rejects_every_operation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.start().expect("start");
    let context = recorder.stop(true).expect("stop").expect("retained");
    assert_eq!(
        recorder.poll_saving_progress(context),
        Err(RecorderError::SaveNotStarted)
    );
    recorder
        .save_async(context, dir.path().join("kept.rec"))
        .expect("save_async");
    assert!(wait_complete(&recorder, context).is_success());
    recorder.discard(context).expect("discard");

    assert_eq!(recorder.live_contexts(), Ok(0));
    assert_eq!(
        recorder.poll_saving_complete(context),
        Err(RecorderError::InvalidHandle)
    );
    assert_eq!(
        recorder.poll_saving_progress(context),
        Err(RecorderError::InvalidHandle)
    );
    assert_eq!(
        recorder.get_select_descriptor(context),
        Err(RecorderError::InvalidHandle)
    );
    assert_eq!(
        recorder.save_async(context, dir.path().join("again.rec")),
        Err(RecorderError::InvalidHandle)
    );
    assert_eq!(recorder.discard(context), Err(RecorderError::InvalidHandle));
}

#[test]
fn completed_save_result_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.start().expect("start");
    let context = recorder.stop(true).expect("stop").expect("retained");
    recorder
        .save_async(context, dir.path().join("stable.rec"))
        .expect("save_async");
    let first = wait_complete(&recorder, context);
    for _ in 0..10 {
        assert_eq!(recorder.poll_saving_complete(context), Ok(Some(first.clone())));
        assert_eq!(
            recorder.poll_saving_progress(context),
            Ok(SaveState::Complete(first.clone()))
        );
    }
    recorder.discard(context).expect("discard");
}

#[test]
fn second_save_while_in_flight_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let fs = Arc::new(GatedFileSystem {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let engine = FakeAttachEngine::with_info(AttachInfo {
        pid: 1,
        threads: vec![1],
        libraries: vec![PathBuf::from("/lib/libgate.so")],
    });
    let recorder = recorder_with(engine, fs);

    recorder.start().expect("start");
    let context = recorder.stop(true).expect("stop").expect("retained");
    let first = dir.path().join("first.rec");
    recorder.save_async(context, &first).expect("first save");
    entered_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("worker reached the gate");

    let before = recorder.poll_saving_progress(context).expect("progress");
    assert!(!before.is_complete());
    assert_eq!(
        recorder.save_async(context, dir.path().join("second.rec")),
        Err(RecorderError::AlreadyInProgress)
    );
    assert_eq!(recorder.discard(context), Err(RecorderError::AlreadyInProgress));
    assert_eq!(recorder.poll_saving_progress(context), Ok(before));

    release_tx.send(()).expect("release");
    assert!(wait_complete(&recorder, context).is_success());
    assert!(!dir.path().join("second.rec").exists());
    let loaded = LoadedRecording::load(&first).expect("load");
    assert_eq!(loaded.symbol_files.len(), 1);
    assert_eq!(loaded.symbol_files[0].size, Some(7));
    recorder.discard(context).expect("discard");
}

#[test]
fn progress_never_goes_backwards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.start().expect("start");
    for n in 0..2_000 {
        recorder
            .record_execution(n % 4, &format!("step {n}"))
            .expect("record");
    }
    let context = recorder.stop(true).expect("stop").expect("retained");
    recorder
        .save_async(context, dir.path().join("big.rec"))
        .expect("save_async");

    let mut last = 0u8;
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match recorder.poll_saving_progress(context).expect("poll") {
            SaveState::InProgress { progress } => {
                let progress = progress.unwrap_or(last);
                assert!(progress >= last, "{progress} < {last}");
                assert!(progress <= 100);
                last = progress;
            }
            SaveState::Complete(result) => {
                assert!(result.is_success());
                break;
            }
        }
        assert!(Instant::now() < deadline, "save did not complete");
        std::thread::yield_now();
    }
    recorder.discard(context).expect("discard");
}

#[test]
fn select_descriptor_signals_completion_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.start().expect("start");
    let context = recorder.stop(true).expect("stop").expect("retained");
    let fd = recorder.get_select_descriptor(context).expect("fd");
    recorder
        .save_async(context, dir.path().join("select.rec"))
        .expect("save_async");

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one live pollfd entry.
    let ready = unsafe { libc::poll(&mut pollfd, 1, 30_000) };
    assert_eq!(ready, 1);
    let mut buf = [0u8; 8];
    // SAFETY: reads into a live local buffer.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(n, 1);
    assert!(recorder
        .poll_saving_complete(context)
        .expect("poll")
        .is_some());
    recorder.discard(context).expect("discard");
}

fn poll_readable(fd: std::os::fd::RawFd, timeout_ms: i32) -> i32 {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one live pollfd entry.
    unsafe { libc::poll(&mut pollfd, 1, timeout_ms) }
}

#[test]
fn select_descriptor_stays_quiet_while_a_resave_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let fs = Arc::new(GatedFileSystem {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let engine = FakeAttachEngine::with_info(AttachInfo {
        pid: 1,
        threads: vec![1],
        libraries: vec![PathBuf::from("/lib/libgate.so")],
    });
    let recorder = recorder_with(engine, fs);
    recorder.start().expect("start");
    let context = recorder.stop(true).expect("stop").expect("retained");
    let fd = recorder.get_select_descriptor(context).expect("fd");

    // First save completes and is never read off the descriptor.
    recorder
        .save_async(context, dir.path().join("a.rec"))
        .expect("first save");
    entered_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("first worker reached the gate");
    release_tx.send(()).expect("release first");
    assert!(wait_complete(&recorder, context).is_success());

    recorder
        .save_async(context, dir.path().join("b.rec"))
        .expect("second save");
    entered_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("second worker reached the gate");
    assert_eq!(poll_readable(fd, 0), 0);
    assert!(!recorder
        .poll_saving_progress(context)
        .expect("progress")
        .is_complete());

    release_tx.send(()).expect("release second");
    assert_eq!(poll_readable(fd, 30_000), 1);
    assert!(wait_complete(&recorder, context).is_success());
    let mut buf = [0u8; 8];
    // SAFETY: reads into a live local buffer.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(n, 1);
    // SAFETY: as above; the descriptor is non-blocking once drained.
    let again = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(again, -1);
    assert!(LoadedRecording::load(&dir.path().join("b.rec")).is_ok());
    recorder.discard(context).expect("discard");
}

#[test]
fn contexts_saving_to_the_same_file_leave_a_loadable_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    let mut contexts = Vec::new();
    for value in [1, 2] {
        recorder.start().expect("start");
        recorder
            .annotation_add_int("counter", None, value)
            .expect("annotate");
        contexts.push(recorder.stop(true).expect("stop").expect("retained"));
    }
    let target = dir.path().join("shared.rec");
    for context in &contexts {
        recorder.save_async(*context, &target).expect("save_async");
    }
    for context in &contexts {
        assert!(wait_complete(&recorder, *context).is_success());
    }

    let values = counter_values(&target);
    assert!(values == vec![1] || values == vec![2], "{values:?}");
    let entries = std::fs::read_dir(dir.path()).expect("read_dir").count();
    assert_eq!(entries, 1);
    for context in contexts {
        recorder.discard(context).expect("discard");
    }
}

#[test]
fn symbol_files_follow_the_runtime_toggle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let library = dir.path().join("libdemo.so");
    std::fs::write(&library, b"\x7fELF-ish").expect("write library");
    let engine = FakeAttachEngine::with_info(AttachInfo {
        pid: 5,
        threads: vec![5],
        libraries: vec![library.clone()],
    });
    let recorder = recorder_with(engine, Arc::new(ProductionFileSystem));
    assert_eq!(recorder.includes_symbol_files(), Ok(true));
    recorder.start().expect("start");

    let with = dir.path().join("with.rec");
    recorder.save(&with).expect("save with");
    recorder.include_symbol_files(false).expect("toggle");
    assert_eq!(recorder.includes_symbol_files(), Ok(false));
    let without = dir.path().join("without.rec");
    recorder.save(&without).expect("save without");
    recorder.stop(false).expect("stop");

    let loaded = LoadedRecording::load(&with).expect("load with");
    assert_eq!(loaded.symbol_files.len(), 1);
    assert_eq!(loaded.symbol_files[0].size, Some(8));
    let loaded = LoadedRecording::load(&without).expect("load without");
    assert!(loaded.symbol_files.is_empty());
}

#[tokio::test]
async fn wait_for_save_resolves_on_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.start().expect("start");
    let context = recorder.stop(true).expect("stop").expect("retained");
    assert_eq!(
        recorder.wait_for_save(context).err(),
        Some(RecorderError::SaveNotStarted)
    );
    recorder
        .save_async(context, dir.path().join("awaited.rec"))
        .expect("save_async");
    let mut rx = recorder.wait_for_save(context).expect("receiver");
    let state = tokio::time::timeout(
        Duration::from_secs(30),
        rx.wait_for(|state| state.is_complete()),
    )
    .await
    .expect("in time")
    .expect("sender alive")
    .clone();
    match state {
        SaveState::Complete(result) => assert!(result.is_success()),
        other => panic!("unexpected {other:?}"),
    }
    recorder.discard(context).expect("discard");
}

#[test]
fn shmem_filename_rules() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    assert_eq!(recorder.shmem_log_size_get(), Ok(0));
    assert!(matches!(
        recorder.shmem_log_filename_set(Some(Path::new("foo.txt"))),
        Err(RecorderError::InvalidArgument(_))
    ));
    assert!(matches!(
        recorder.shmem_log_filename_set(Some(Path::new("foo.shamem"))),
        Err(RecorderError::InvalidArgument(_))
    ));
    let shmem = dir.path().join("foo.shmem");
    recorder
        .shmem_log_filename_set(Some(&shmem))
        .expect("valid name");
    recorder.shmem_log_size_set(1 << 20).expect("size");
    assert_eq!(recorder.shmem_log_size_get(), Ok(1 << 20));
    assert_eq!(recorder.shmem_log_filename_get(), Ok(Some(shmem.clone())));

    recorder.start().expect("start");
    assert!(matches!(
        recorder.shmem_log_filename_set(Some(&shmem)),
        Err(RecorderError::InvalidArgument(_))
    ));
    assert!(recorder.shmem_log_size_set(4096).is_err());
    let written = recorder
        .record_shmem_access(ShmemAccess {
            address: 0xdead_0000,
            len: 4,
            kind: AccessKind::Read,
        })
        .expect("record");
    assert!(written);
    let saved = dir.path().join("with-shmem.rec");
    recorder.save(&saved).expect("save");
    recorder.stop(false).expect("stop");

    recorder.shmem_log_filename_set(None).expect("clear");
    assert_eq!(recorder.shmem_log_filename_get(), Ok(None));
    assert_eq!(
        LoadedRecording::load(&saved).expect("load").shmem_log,
        Some(shmem.clone())
    );
    let contents = read_shmem_log(&shmem).expect("read");
    assert_eq!(contents.records.len(), 1);
    assert_eq!(contents.records[0].address, 0xdead_0000);
}

#[test]
fn shmem_access_without_log_is_not_written() {
    let recorder = recorder();
    let access = ShmemAccess {
        address: 0,
        len: 1,
        kind: AccessKind::Write,
    };
    assert_eq!(
        recorder.record_shmem_access(access),
        Err(RecorderError::NotRecording)
    );
    recorder.start().expect("start");
    assert_eq!(recorder.record_shmem_access(access), Ok(false));
}

#[test]
fn test_annotations_need_a_session_only_to_emit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    let test = recorder
        .test_annotation_new("suite.case", true)
        .expect("new without session");
    assert_eq!(
        recorder.test_annotation_name(test),
        Ok("suite.case-run-1".to_string())
    );
    assert_eq!(
        recorder.test_annotation_start(test),
        Err(RecorderError::NotRecording)
    );
    assert_eq!(
        recorder.test_annotation_add_int(test, "step", 1),
        Err(RecorderError::NotRecording)
    );
    assert_eq!(recorder.test_annotation_state(test), Ok((false, false)));

    recorder.start().expect("start");
    recorder.test_annotation_start(test).expect("start test");
    assert!(matches!(
        recorder.test_annotation_add_text(test, "", ContentType::Xml, Some("<a/>")),
        Err(RecorderError::InvalidArgument(_))
    ));
    recorder
        .test_annotation_set_output(test, ContentType::UnstructuredText, "ok\n")
        .expect("output");
    recorder
        .test_annotation_set_result(test, TestResult::Failure)
        .expect("result");
    recorder.test_annotation_end(test).expect("end");
    assert_eq!(recorder.test_annotation_state(test), Ok((true, true)));

    let second = recorder
        .test_annotation_new("suite.case", true)
        .expect("second run");
    assert_eq!(
        recorder.test_annotation_name(second),
        Ok("suite.case-run-2".to_string())
    );

    let path = dir.path().join("tests.rec");
    recorder.save(&path).expect("save");
    recorder.stop(false).expect("stop");
    recorder.test_annotation_free(test).expect("free");
    recorder.test_annotation_free(second).expect("free");
    assert_eq!(
        recorder.test_annotation_free(test),
        Err(RecorderError::InvalidHandle)
    );
    assert_eq!(
        recorder.test_annotation_end(test),
        Err(RecorderError::InvalidHandle)
    );

    let loaded = LoadedRecording::load(&path).expect("load");
    let details: Vec<_> = loaded
        .annotations_named("suite.case-run-1")
        .map(|a| a.detail.clone())
        .collect();
    assert_eq!(details[0], DETAIL_TEST_START);
    let result = loaded
        .annotations_named("suite.case-run-1")
        .find(|a| a.detail == DETAIL_TEST_RESULT)
        .expect("result annotation");
    assert_eq!(result.content, AnnotationContent::Int { value: 2 });
}

#[test]
fn legacy_entry_points() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.recording_start().expect("start");
    recorder.recording_start().expect("idempotent");
    recorder.recording_stop().expect("stop");
    assert_eq!(recorder.recording_stop(), Err(RecorderError::NotRecording));

    recorder.recording_start().expect("restart");
    recorder
        .annotation_add_int("counter", None, 1)
        .expect("annotate");
    let path = dir.path().join("legacy.rec");
    let context = recorder.recording_stop_and_save(&path).expect("stop and save");
    assert!(wait_complete(&recorder, context).is_success());
    recorder.discard(context).expect("discard");
    assert_eq!(counter_values(&path), vec![1]);

    assert_eq!(recorder.start(), Err(RecorderError::Detached));
    assert_eq!(recorder.recording_start(), Err(RecorderError::Detached));
}

#[test]
fn small_event_log_evicts_oldest_and_reports_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    recorder.event_log_size_set(2048).expect("size");
    recorder.start().expect("start");
    let mut positions = Vec::new();
    for n in 0..200 {
        positions.push(
            recorder
                .annotation_add_int("counter", Some("tick"), n)
                .expect("annotate"),
        );
    }
    assert!(positions.windows(2).all(|w| w[1] > w[0]));
    let path = dir.path().join("evicted.rec");
    recorder.save(&path).expect("save");

    let loaded = LoadedRecording::load(&path).expect("load");
    assert!(loaded.header.evicted_events > 0);
    assert_eq!(loaded.header.next_position, 201);
    let values = counter_values(&path);
    assert_eq!(values.last(), Some(&199));
    assert!(values.len() < 200);
}

#[test]
fn termination_save_writes_registered_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = recorder();
    assert_eq!(recorder.run_termination_save(), Ok(None));
    recorder.start().expect("start");
    assert!(matches!(
        recorder.save_on_termination(""),
        Err(RecorderError::InvalidArgument(_))
    ));
    let path = dir.path().join("exit.rec");
    recorder.save_on_termination(&path).expect("register");
    assert_eq!(recorder.run_termination_save(), Ok(Some(path.clone())));
    assert!(LoadedRecording::load(&path).is_ok());
}

#[test]
fn stop_and_save_with_unusable_filename_keeps_recorder_restartable() {
    let recorder = recorder();
    recorder.start().expect("start");
    assert!(matches!(
        recorder.recording_stop_and_save(""),
        Err(RecorderError::InvalidArgument(_))
    ));
    assert_eq!(recorder.live_contexts(), Ok(0));
    assert_eq!(recorder.is_recording(), Ok(false));
    recorder.start().expect("restart");
    recorder.stop(false).expect("stop");
}
