//! CLI module; subcommands live here.
//!
//! The subcommands drive the mount core without a kernel: listing, copying
//! files out of a repository, inspecting catalog files and dumping mount
//! statistics.

use clap::{CommandFactory, Parser, Subcommand};

use crate::Result;

pub mod common;
pub mod cp;
pub mod inspect;
pub mod ls;
pub mod stat;

#[derive(Debug, Clone)]
pub enum Command {
    Ls(ls::LsArgs),
    Cp(cp::CpArgs),
    Inspect(inspect::InspectArgs),
    Stat(stat::StatArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Ls(a) => ls::execute(a),
        Command::Cp(a) => cp::execute(a),
        Command::Inspect(a) => inspect::execute(a),
        Command::Stat(a) => stat::execute(a),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "casfs",
    version,
    about = "Tools for content-addressed repository filesystems"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// List a directory of a repository.
    Ls(ls::LsArgs),
    /// Copy a file out of a repository without mounting it.
    Cp(cp::CpArgs),
    /// Show invariants and statistics of a local catalog file.
    Inspect(inspect::InspectArgs),
    /// Mount a repository's catalogs and dump runtime statistics.
    Stat(stat::StatArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Ls(args)) => Command::Ls(args),
        Some(Subcommands::Cp(args)) => Command::Cp(args),
        Some(Subcommands::Inspect(args)) => Command::Inspect(args),
        Some(Subcommands::Stat(args)) => Command::Stat(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
