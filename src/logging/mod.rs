//! Logging initialization using `tracing` and `tracing-subscriber`.

use std::path::{Path, PathBuf};

use tracing::info;
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Default)]
pub enum LogSink {
    /// Log to stderr to avoid interleaving user output and logs.
    #[default]
    Console,
    /// Append-only log file.
    File(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub sink: LogSink,
    pub debug: bool,
}

/// Snapshot of filesystem call counters, emitted on demand so hot paths do
/// not log per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCallSnapshot {
    pub lookup: u64,
    pub lookup_negative: u64,
    pub stat: u64,
    pub open: u64,
    pub diropen: u64,
    pub read: u64,
    pub readlink: u64,
    pub forget: u64,
    pub io_errors: u32,
    pub open_files: i32,
    pub open_dirs: i32,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = if config.debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (writer, ansi) = match &config.sink {
        LogSink::Console => (BoxMakeWriter::new(std::io::stderr), true),
        LogSink::File(path) => {
            ensure_parent(path)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(std::sync::Mutex::new(file)), false)
        }
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Emit the filesystem call counters as one structured event.
pub fn log_fs_call_metrics(snapshot: FsCallSnapshot) {
    info!(
        target = "casfs::fs",
        lookup = snapshot.lookup,
        lookup_negative = snapshot.lookup_negative,
        stat = snapshot.stat,
        open = snapshot.open,
        diropen = snapshot.diropen,
        read = snapshot.read,
        readlink = snapshot.readlink,
        forget = snapshot.forget,
        io_errors = snapshot.io_errors,
        open_files = snapshot.open_files,
        open_dirs = snapshot.open_dirs,
        "fs_call_metrics"
    );
}
