//! Implementation of `casfs stat`: bring the catalog tree up and dump the
//! runtime statistics surface.

use clap::Args;

use super::common::{build_mount_state, RepoArgs};
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct StatArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Also print the attached catalog hierarchy
    #[arg(long = "hierarchy", default_value_t = false)]
    pub hierarchy: bool,
}

pub fn execute(args: StatArgs) -> Result<()> {
    let state = build_mount_state(&args.repo)?;

    println!("fqrn:       {}", state.settings().fqrn);
    println!("revision:   {}", state.catalog_mgr.get_revision());
    if let Some(root_hash) = state.catalog_mgr.get_root_hash() {
        println!("root hash:  {root_hash}");
    }
    println!("root inode: {}", state.catalog_mgr.get_root_inode());
    println!("ttl:        {} s", state.catalog_mgr.get_ttl());
    println!("catalogs:   {}", state.catalog_mgr.num_catalogs());
    println!("offline:    {}", state.catalog_mgr.offline_mode());
    println!();
    print!("{}", state.fs_stats());
    let tracker_stats = state.tracker().get_statistics();
    println!(
        "inode tracker: inserts {}  removes {}  references {}",
        tracker_stats.num_inserts, tracker_stats.num_removes, tracker_stats.num_references
    );

    if args.hierarchy {
        println!();
        print!("{}", state.catalog_mgr.print_hierarchy());
    }
    Ok(())
}
