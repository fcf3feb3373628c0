use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::commands::{report::ReportArgs, rebuild::RebuildArgs, show::ShowArgs};

#[derive(Debug, Parser)]
#[command(
    name = "lineage",
    version,
    about = "Reconstruct task hierarchies from local assistant conversation logs"
)]
pub struct Cli {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    #[arg(long, global = true, value_name = "PATH")]
    pub home_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub cwd: Option<PathBuf>,

    /// Directory holding one sub-directory per task.
    #[arg(long, global = true, value_name = "PATH")]
    pub storage_root: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub out_dir: Option<PathBuf>,

    #[arg(long, short = 'v', global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Rebuild one generation and write its artifacts.
    Rebuild(RebuildArgs),
    /// Print one task with its parent chain and children.
    Show(ShowArgs),
    /// Print the resolution report of a fresh generation.
    Report(ReportArgs),
}
