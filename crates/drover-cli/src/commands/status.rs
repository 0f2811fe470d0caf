use crate::cli::StatusArgs;
use crate::commands::load_all_runs;
use crate::error::{CliError, Result};
use colored::Colorize;
use drover_core::config::Config;
use drover_core::state::{Run, RunState};

fn paint_state(state: RunState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        RunState::Successful => text.green(),
        RunState::Failed | RunState::Failing => text.red(),
        RunState::Cancelled | RunState::Cancelling => text.yellow(),
        RunState::Running => text.cyan(),
        RunState::Quarantined => text.magenta(),
        RunState::Pending => text.normal(),
    }
}

fn print_run(run: &Run) {
    println!(
        "{:<10} {:<11} {:<24} {:<12} [{}]",
        run.id.short_id(),
        paint_state(run.state),
        run.pipeline.name,
        run.owner,
        run.render_progress()
    );
}

pub fn handle_status(args: StatusArgs, config: Config) -> Result<()> {
    let runs = load_all_runs(&config.sandboxes_dir())?;

    if let Some(wanted) = args.run_id {
        let run = runs
            .iter()
            .find(|r| r.id.0.starts_with(&wanted))
            .ok_or(CliError::RunNotFound(wanted))?;
        print_run(run);
        if let Some(condition) = &run.condition {
            println!("  condition: {:?}", condition);
        }
        for component in &run.components {
            println!(
                "  {:<14} {:<11} reused={}",
                component.id.to_string(),
                component.state.to_string(),
                component.reused
            );
        }
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    println!(
        "{:<10} {:<11} {:<24} {:<12} progress",
        "RUN", "STATE", "PIPELINE", "OWNER"
    );
    for run in &runs {
        print_run(run);
    }
    Ok(())
}
