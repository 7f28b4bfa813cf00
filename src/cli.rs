//! Command-line definitions.
//!
//! ```text
//! depotsync sync <dir> [--prefix P] [--at CL] [--force]
//! depotsync clean <dir> [--at CL] [--discard]
//! depotsync fstat --prefix P [--from A] --to B
//! depotsync head --prefix P
//! depotsync drop (--checksum | --havelist) [--root DIR]
//! depotsync keep --case [--root DIR]
//! depotsync progress
//! depotsync fail
//! depotsync transfer [--force] --prefix P [--root DIR]
//! depotsync serve --listen ADDR --store DIR
//! depotsync ingest --store DIR --prefix P --at CL
//! ```
//!
//! Stage subcommands read records on stdin and write survivors to stdout.

use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "depotsync",
    version,
    about = "Sync a directory to an exact depot changelist",
    long_about = None,
)]
pub struct Cli {
    /// Config file (default: $DEPOTSYNC_CONFIG, then the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default tracing directive for the verbosity flags.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring a directory to a changelist, verifying every file.
    Sync(SyncArgs),

    /// Remove files the depot doesn't have, then force-sync.
    Clean(CleanArgs),

    /// Print the records changed in (from, to].
    Fstat(FstatArgs),

    /// Print the head changelist of a prefix.
    Head(PrefixArg),

    /// Drop records that need no transfer.
    Drop(DropArgs),

    /// Keep records whose local path case matches.
    Keep(KeepArgs),

    /// Pass records through, counting them on stderr.
    Progress,

    /// Exit nonzero if any record arrives.
    Fail,

    /// Transfer records in batches through the transfer command.
    Transfer(TransferArgs),

    /// Run the fstat cache service.
    Serve(ServeArgs),

    /// Add a changelist to the cache store.
    Ingest(IngestArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Directory to sync
    pub dir: PathBuf,

    /// Depot prefix (remembered after the first sync)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Target changelist (default: depot head)
    #[arg(long, value_name = "CL")]
    pub at: Option<u64>,

    /// Re-verify every file from changelist 0
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    pub dir: PathBuf,

    #[arg(long)]
    pub prefix: Option<String>,

    /// Changelist to clean to (default: last synced, else head)
    #[arg(long, value_name = "CL")]
    pub at: Option<u64>,

    /// Delete extra files instead of moving them to .depotsync/cleaned
    #[arg(long)]
    pub discard: bool,
}

#[derive(Args, Debug)]
pub struct FstatArgs {
    #[arg(long)]
    pub prefix: String,

    #[arg(long, default_value_t = 0)]
    pub from: u64,

    #[arg(long)]
    pub to: u64,
}

#[derive(Args, Debug)]
pub struct PrefixArg {
    #[arg(long)]
    pub prefix: String,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("what").required(true).args(["checksum", "havelist"])))]
pub struct DropArgs {
    /// Drop records whose local file already matches
    #[arg(long)]
    pub checksum: bool,

    /// Drop records the have-list already holds
    #[arg(long)]
    pub havelist: bool,

    /// Local root (default: current directory)
    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

#[derive(Args, Debug)]
pub struct KeepArgs {
    /// Drop records whose on-disk name differs only in case
    #[arg(long, required = true)]
    pub case: bool,

    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Use the force arguments of the transfer command
    #[arg(long)]
    pub force: bool,

    #[arg(long)]
    pub prefix: String,

    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7311")]
    pub listen: String,

    /// Cache store directory
    #[arg(long)]
    pub store: PathBuf,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[arg(long)]
    pub store: PathBuf,

    #[arg(long)]
    pub prefix: String,

    #[arg(long, value_name = "CL")]
    pub at: u64,

    /// Prune the prefix down to this many entries afterwards
    #[arg(long)]
    pub keep: Option<usize>,
}
