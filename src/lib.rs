use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;
use thiserror::Error;

pub mod binding;
pub mod cache;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod download;
pub mod fs;
pub mod glue;
pub mod hash;
pub mod logging;
pub mod manifest;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid cache directory: {0}")]
    InvalidCacheDir(String),
    #[error("repository {fqrn} already mounted (lock held: {lock})")]
    AlreadyMounted { fqrn: String, lock: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("malformed manifest: {0}")]
    Manifest(String),
    #[error("manifest signature rejected for {0}")]
    BadSignature(String),
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
    #[error(transparent)]
    Cache(#[from] cache::CacheError),
    #[error(transparent)]
    Download(#[from] download::DownloadError),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    // Initialize logging before doing anything else. Defaults to human format for the CLI.
    logging::init_logging(logging::LoggingConfig::default())?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}

/// Process-wide lock serializing environment mutation (tests run in parallel).
pub fn env_lock() -> &'static ReentrantMutex<()> {
    static LOCK: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));
    &LOCK
}
