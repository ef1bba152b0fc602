pub mod annotation;
pub mod arena;
pub mod config;
pub mod errors;
pub mod event_log;
pub mod global;
pub mod logging;
pub mod recording;
pub mod runtime;
pub mod save;
pub mod session;
pub mod shmem;
pub mod test_annotation;

use annotation::{AnnotationContent, ContentType};
use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, CliOverrides, RecorderConfig};
use errors::{io_err, RecorderError};
use logging::{append_run_log, init_run_logger};
use recording::LoadedRecording;
use runtime::{FileSystem, InProcessEngine, ProductionFileSystem};
use serde_json::json;
use session::Recorder;
use shmem::{read_shmem_log, AccessKind, ShmemAccess};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use test_annotation::TestResult;

/// Version of the recorder, as stored in saved recordings.
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "liverec")]
#[command(about = "Inspect recordings and exercise the live recorder")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,
    #[arg(long, global = true)]
    pub event_log_size: Option<u64>,
    #[arg(long, global = true)]
    pub shmem_log: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    pub no_symbol_files: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print a summary of a saved recording.
    Inspect { recording: PathBuf },
    /// Print the annotations of a saved recording as JSON lines.
    Annotations {
        recording: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Print a summary of a shared memory access log.
    Shmem { log: PathBuf },
    /// Record a short scripted session of this process into a directory.
    Demo {
        #[arg(long)]
        out: PathBuf,
    },
}

pub fn run() -> Result<i32, RecorderError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(io_err)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_runtime(&args, &cwd, &ProductionFileSystem, &mut out)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    fs: &dyn FileSystem,
    out: &mut dyn Write,
) -> Result<i32, RecorderError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}").map_err(io_err)?;
                return Ok(0);
            }
            _ => return Err(RecorderError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.as_ref().map(|p| resolve(cwd, p)),
        event_log_size: cli.event_log_size,
        include_symbol_files: cli.no_symbol_files.then_some(false),
        shmem_log: cli.shmem_log.as_ref().map(|p| resolve(cwd, p)),
        log_path: cli.log.as_ref().map(|p| resolve(cwd, p)),
    };
    let cfg = load_config(&overrides, fs)?;
    if let Some(path) = &cfg.logging.path {
        init_run_logger(path);
    }
    append_run_log(
        "info",
        "cli.start",
        json!({ "version": version_string(), "command": format!("{:?}", cli.command) }),
    );

    match &cli.command {
        Command::Inspect { recording } => inspect(&resolve(cwd, recording), out)?,
        Command::Annotations { recording, name } => {
            print_annotations(&resolve(cwd, recording), name.as_deref(), out)?
        }
        Command::Shmem { log } => shmem_summary(&resolve(cwd, log), out)?,
        Command::Demo { out: dir } => demo(&cfg, &resolve(cwd, dir), out)?,
    }
    Ok(0)
}

fn resolve(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

fn describe_content(content: &AnnotationContent) -> String {
    match content {
        AnnotationContent::None => "-".to_string(),
        AnnotationContent::Raw { bytes } => format!("raw[{}]", bytes.len()),
        AnnotationContent::Text { content_type, text } => {
            format!("{}:{text}", content_type.as_str())
        }
        AnnotationContent::Int { value } => format!("int:{value}"),
    }
}

fn inspect(path: &Path, out: &mut dyn Write) -> Result<(), RecorderError> {
    let recording = LoadedRecording::load(path)?;
    let header = &recording.header;
    writeln!(
        out,
        "recording {}: pid={} events={} evicted={} annotations={} symbol_files={} shmem_log={}",
        path.display(),
        header.pid,
        recording.events.len(),
        header.evicted_events,
        recording.annotations().count(),
        recording.symbol_files.len(),
        recording
            .shmem_log
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
    )
    .map_err(io_err)?;
    for (position, annotation) in recording.annotations() {
        writeln!(
            out,
            "  @{position} {} [{}] {}",
            annotation.name,
            annotation.detail,
            describe_content(&annotation.content)
        )
        .map_err(io_err)?;
    }
    Ok(())
}

fn print_annotations(
    path: &Path,
    name: Option<&str>,
    out: &mut dyn Write,
) -> Result<(), RecorderError> {
    let recording = LoadedRecording::load(path)?;
    for (position, annotation) in recording.annotations() {
        if name.is_some_and(|name| annotation.name != name) {
            continue;
        }
        let line = json!({
            "position": position,
            "name": annotation.name,
            "detail": annotation.detail,
            "content": annotation.content,
        });
        writeln!(out, "{line}").map_err(io_err)?;
    }
    Ok(())
}

fn shmem_summary(path: &Path, out: &mut dyn Write) -> Result<(), RecorderError> {
    let contents = read_shmem_log(path)?;
    writeln!(
        out,
        "shmem log {}: records={} writers={} malformed={}",
        path.display(),
        contents.records.len(),
        contents.writers().len(),
        contents.malformed_lines
    )
    .map_err(io_err)
}

/// Blocks until the context's select descriptor becomes readable.
fn wait_for_descriptor(fd: std::os::fd::RawFd) -> Result<(), RecorderError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: `pollfd` is a single live entry and the count passed is 1.
        let ret = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if ret >= 0 {
            return Ok(());
        }
        let error = std::io::Error::last_os_error();
        if error.kind() != std::io::ErrorKind::Interrupted {
            return Err(io_err(error));
        }
    }
}

/// Scripted session against the current process. The recorder is left
/// recording with a save-on-termination registered, so `exit.rec` is written
/// by the exit hook when the process ends. Shared memory accesses go to the
/// configured log, or `demo.shmem` in `dir` when none is configured.
fn demo(cfg: &RecorderConfig, dir: &Path, out: &mut dyn Write) -> Result<(), RecorderError> {
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let recorder = Arc::new(Recorder::new(cfg, Some(Arc::new(InProcessEngine::new()))));
    global::install_recorder(Arc::clone(&recorder));

    let shmem_path = match global::shmem_log_filename_get()? {
        Some(configured) => configured,
        None => {
            let path = dir.join("demo.shmem");
            global::shmem_log_filename_set(Some(&path))?;
            path
        }
    };
    global::start()?;
    for run in 1..=2 {
        global::annotation_add_int("counter", Some("run"), run)?;
        global::record_shmem_access(ShmemAccess {
            address: 0x1000 * run as u64,
            len: 8,
            kind: AccessKind::Write,
        })?;
    }
    global::annotation_add_text(
        "config",
        None,
        ContentType::Json,
        Some(r#"{"demo":true}"#),
    )?;

    let test = global::test_annotation_new("demo", true)?;
    global::test_annotation_start(test)?;
    global::test_annotation_set_result(test, TestResult::Success)?;
    global::test_annotation_end(test)?;
    global::test_annotation_free(test)?;

    let live = dir.join("live.rec");
    global::save(&live)?;
    writeln!(out, "saved {}", live.display()).map_err(io_err)?;

    let context = global::stop(true)?.ok_or(RecorderError::NotRecording)?;
    let stopped = dir.join("stopped.rec");
    let fd = global::get_select_descriptor(context)?;
    global::save_async(context, &stopped)?;
    wait_for_descriptor(fd)?;
    let result = global::poll_saving_complete(context)?.ok_or(RecorderError::AlreadyInProgress)?;
    global::discard(context)?;
    if let Some(error) = result.error {
        return Err(RecorderError::Io(error));
    }
    writeln!(out, "saved {}", stopped.display()).map_err(io_err)?;

    global::start()?;
    let exit = dir.join("exit.rec");
    global::save_on_termination(&exit)?;
    writeln!(out, "on exit {}", exit.display()).map_err(io_err)?;
    writeln!(out, "shmem {}", shmem_path.display()).map_err(io_err)?;
    Ok(())
}
