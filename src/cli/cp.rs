//! Implementation of `casfs cp`: extract a file from a repository without
//! mounting it.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::Args;
use tracing::info;

use super::common::{build_mount_state, normalize_repo_path, RepoArgs};
use crate::catalog::LookupMode;
use crate::hash::ObjectSuffix;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct CpArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Source path inside the repository
    pub source: String,

    /// Local destination file
    pub destination: PathBuf,
}

pub fn execute(args: CpArgs) -> Result<()> {
    let state = build_mount_state(&args.repo)?;
    let path = normalize_repo_path(&args.source);

    let entry = state
        .catalog_mgr
        .lookup_path(&path, LookupMode::Full)?
        .ok_or_else(|| Error::Cli(format!("no such file: {}", args.source)))?;
    if !entry.is_regular() {
        return Err(Error::Cli(format!("not a regular file: {}", args.source)).into());
    }

    let mut destination = File::create(&args.destination)?;
    let copied = if entry.is_chunked() {
        copy_chunked(&state, &path, &mut destination)?
    } else {
        copy_object(&state, &entry, &path, &mut destination)?
    };
    destination.flush()?;
    info!(
        source = %args.source,
        destination = %args.destination.display(),
        bytes = copied,
        "copy complete"
    );
    Ok(())
}

fn copy_object(
    state: &crate::fs::MountState,
    entry: &crate::catalog::DirectoryEntry,
    path: &str,
    destination: &mut File,
) -> Result<u64> {
    let object = state
        .fetcher()
        .fetch_object(&entry.checksum, path, ObjectSuffix::Plain)?;
    stream_object(&object, destination)
}

fn copy_chunked(
    state: &crate::fs::MountState,
    path: &str,
    destination: &mut File,
) -> Result<u64> {
    let chunks = state.catalog_mgr.list_chunks(path)?;
    if chunks.is_empty() {
        return Err(Error::Cli(format!("chunked file without chunks: {path}")).into());
    }
    let mut total = 0;
    for chunk in &chunks {
        let object = state.fetcher().fetch_object(
            &chunk.content_hash,
            &format!("chunk of {path}"),
            ObjectSuffix::Partial,
        )?;
        total += stream_object(&object, destination)?;
    }
    Ok(total)
}

fn stream_object(object: &crate::cache::ObjectHandle, destination: &mut File) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    loop {
        let got = object.pread(&mut buf, offset)?;
        if got == 0 {
            break;
        }
        destination.write_all(&buf[..got])?;
        offset += got as u64;
    }
    Ok(offset)
}
