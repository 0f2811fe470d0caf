mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use drover_core::config::Config;
use error::CliError;

fn main() {
    let cli = Cli::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        let level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    if let Err(e) = dispatch(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Manager(args) => {
            drover_core::logging::init_session_logger(&config.logging)?;
            commands::handle_manager(args, config)
        }
        Commands::PurgeSandboxes(args) => {
            drover_core::logging::init_stderr_logger();
            commands::handle_purge_sandboxes(args, config)
        }
        Commands::CheckRuns => {
            drover_core::logging::init_stderr_logger();
            commands::handle_check_runs(config)
        }
        Commands::Status(args) => {
            drover_core::logging::init_stderr_logger();
            commands::handle_status(args, config)
        }
    }
}
