//! Implementation of `casfs inspect`: open a catalog file outside any mount
//! and print its invariants.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::catalog::Catalog;
use crate::hash::ContentHash;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct InspectArgs {
    /// Path to a local catalog database file
    pub catalog_file: PathBuf,

    /// Also list the registered nested catalogs
    #[arg(long = "nested", default_value_t = false)]
    pub nested: bool,
}

pub fn execute(args: InspectArgs) -> Result<()> {
    let catalog = Arc::new(Catalog::new(
        "",
        ContentHash::default(),
        std::sync::Weak::new(),
    ));
    catalog.init_standalone(&args.catalog_file)?;

    println!("schema:            {}", catalog.schema_version());
    println!("revision:          {}", catalog.revision());
    if let Some(previous) = catalog.previous_revision() {
        println!("previous revision: {previous}");
    }
    println!("ttl:               {} s", catalog.ttl());
    println!("entries:           {}", catalog.num_entries());
    println!("max row id:        {}", catalog.max_rowid());
    let counters = catalog.counters();
    println!(
        "counters:          {} regular, {} directories, {} symlinks, {} nested, {} chunked",
        counters.regular, counters.directory, counters.symlink, counters.nested, counters.chunked
    );

    if args.nested {
        for nested in catalog.list_nested()?.iter() {
            println!("nested: {} -> {}", nested.mountpoint, nested.hash);
        }
    }
    Ok(())
}
