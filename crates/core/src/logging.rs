//! Log filters, the daily log file and crash reports for `tilefuse`.
//!
//! Everything lives under `<data_dir>/logs`; crash reports go to
//! `<data_dir>/logs/crash`, one file per panic.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt, fs,
    io::Write,
    panic::{self, AssertUnwindSafe, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        OnceLock,
    },
    thread,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";

const LOG_FILE_PREFIX: &str = "tilefuse";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_RETENTION_FILES: usize = 14;

/// ONNX Runtime forwards its own log stream through `tracing` under `ort`.
/// Its warnings are too chatty for the console but useful in the file.
const ORT_CONSOLE_DIRECTIVE: &str = "ort=error";
const ORT_FILE_DIRECTIVE: &str = "ort=warn";

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static WRITING_CRASH_REPORT: AtomicBool = AtomicBool::new(false);
static CRASH_REPORT_SEQ: AtomicU32 = AtomicU32::new(0);

/// What the user asked for on the command line and in the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    /// `--log-filter`
    pub filter: Option<String>,
    /// `RUST_LOG`
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    ///
    /// An explicit filter or verbosity is used as-is for both sinks. Otherwise
    /// the `ort` directives are prepended.
    pub fn filters(&self) -> LogFilters {
        let explicit = match (&self.filter, self.verbose) {
            (Some(filter), _) => Some(filter.clone()),
            (None, 0) => None,
            (None, 1) => Some("debug".to_string()),
            (None, _) => Some("trace".to_string()),
        };
        if let Some(filter) = explicit {
            return LogFilters {
                console: filter.clone(),
                file: filter,
            };
        }

        let base = self
            .rust_log
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);
        LogFilters {
            console: format!("{ORT_CONSOLE_DIRECTIVE},{base}"),
            file: format!("{ORT_FILE_DIRECTIVE},{base}"),
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Open the daily-rotated `tilefuse.*.log` appender, keeping two weeks of files.
pub fn open_log_file(data_dir: &Path) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(&dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))
}

/// Chain a panic hook that writes a [`CrashReport`] before the previous hook
/// runs. Only the first call installs anything; later calls return the
/// directory already in use.
pub fn install_crash_reporter(data_dir: &Path) -> Result<PathBuf> {
    if let Some(dir) = CRASH_DIR.get() {
        return Ok(dir.clone());
    }

    let dir = crash_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create crash directory: {}", dir.display()))?;

    if CRASH_DIR.set(dir.clone()).is_err() {
        return Ok(CRASH_DIR.get().cloned().unwrap_or(dir));
    }

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if let Some(dir) = CRASH_DIR.get() {
            record_crash(dir, info);
        }
        previous(info);
    }));
    Ok(dir)
}

fn record_crash(dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the report writer must not recurse.
    if WRITING_CRASH_REPORT.swap(true, Ordering::AcqRel) {
        return;
    }

    let written = panic::catch_unwind(AssertUnwindSafe(|| CrashReport::capture(info).write_to(dir)));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash report under '{}': {error}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash report writer panicked under '{}'",
            dir.display()
        ),
    }

    WRITING_CRASH_REPORT.store(false, Ordering::Release);
}

/// One panic, as written to `panic-<utc time>-<pid>-<seq>.log`.
#[derive(Debug)]
pub struct CrashReport {
    pub time: DateTime<Utc>,
    pub thread: String,
    pub location: String,
    pub message: String,
    pub backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let backtrace = match backtrace.status() {
            BacktraceStatus::Captured => backtrace.to_string(),
            _ => "unavailable (run with RUST_BACKTRACE=1)".to_string(),
        };
        Self {
            time: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_text(info.payload()),
            backtrace,
        }
    }

    fn file_name(&self) -> String {
        let seq = CRASH_REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        format!(
            "panic-{}-{}-{seq}.log",
            self.time.format("%Y%m%dT%H%M%S%.3fZ"),
            std::process::id()
        )
    }

    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let mut file = fs::File::create(&path)?;
        write!(file, "{self}")?;
        file.flush()?;
        Ok(path)
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tilefuse {} panicked at {}",
            env!("CARGO_PKG_VERSION"),
            self.time.to_rfc3339()
        )?;
        writeln!(f, "thread:   {}", self.thread)?;
        writeln!(f, "location: {}", self.location)?;
        writeln!(f, "message:  {}", self.message)?;
        writeln!(f)?;
        writeln!(f, "backtrace:")?;
        writeln!(f, "{}", self.backtrace)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
