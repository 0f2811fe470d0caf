use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Pipeline run scheduler and execution coordinator.",
    long_about = "drover turns pipeline run requests into scheduled tasks on a local worker \
                  pool or a Slurm cluster, memoizing every execution by content fingerprint."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short,
        long,
        global = true,
        help = "Path to a drover config.toml (defaults to the XDG config home)"
    )]
    pub config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the scheduling manager")]
    Manager(ManagerArgs),

    #[command(about = "Delete sandboxes of terminal runs past the retention window")]
    PurgeSandboxes(PurgeArgs),

    #[command(about = "Recompute every stored run's state and report drift")]
    CheckRuns,

    #[command(about = "List runs with their per-component progress")]
    Status(StatusArgs),
}

#[derive(Args)]
pub struct ManagerArgs {
    #[arg(long, help = "Shut down once no queued or active runs remain")]
    pub quit_idle: bool,
}

#[derive(Args)]
pub struct PurgeArgs {
    #[arg(long, help = "Override the configured sandbox retention window")]
    pub older_than_days: Option<u64>,
}

#[derive(Args)]
pub struct StatusArgs {
    #[arg(help = "Show a single run (id or id prefix)")]
    pub run_id: Option<String>,
}
