//! Implementation of `casfs ls`.

use clap::Args;

use super::common::{build_mount_state, normalize_repo_path, RepoArgs};
use crate::catalog::LookupMode;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct LsArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Directory inside the repository
    #[arg(default_value = "/")]
    pub path: String,

    /// Long format: mode, size, name
    #[arg(short = 'l', default_value_t = false)]
    pub long: bool,
}

pub fn execute(args: LsArgs) -> Result<()> {
    let state = build_mount_state(&args.repo)?;
    let path = normalize_repo_path(&args.path);

    let entry = state
        .catalog_mgr
        .lookup_path(&path, LookupMode::Full)?
        .ok_or_else(|| Error::Cli(format!("no such path: {}", args.path)))?;
    if !entry.is_directory() {
        return Err(Error::Cli(format!("not a directory: {}", args.path)).into());
    }

    let mut listing = state.catalog_mgr.listing(&path)?;
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    for child in listing {
        if args.long {
            println!(
                "{:o} {:>12} {}{}",
                child.full_mode(),
                child.size,
                child.name,
                if child.is_directory() { "/" } else { "" }
            );
        } else {
            println!("{}", child.name);
        }
    }
    Ok(())
}
