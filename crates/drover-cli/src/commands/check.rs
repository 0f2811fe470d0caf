use crate::commands::load_all_runs;
use crate::error::{CliError, Result};
use drover_core::config::Config;
use drover_core::state::{roll_up, ComponentState, RunState};
use std::collections::HashMap;

/// Recomputes every persisted run's state from scratch through the same
/// roll-up function the scheduler maintains it with, and reports any
/// drift. A mismatch means the stored record was corrupted or edited by
/// hand; the scheduler itself cannot produce one.
pub fn handle_check_runs(config: Config) -> Result<()> {
    let runs = load_all_runs(&config.sandboxes_dir())?;

    let by_id: HashMap<_, _> = runs.iter().map(|r| (r.id.clone(), r.state)).collect();
    let mut drift = 0usize;

    for run in &runs {
        let components: Vec<ComponentState> = run.components.iter().map(|c| c.state).collect();
        let children: Vec<RunState> = run
            .children
            .iter()
            .map(|link| {
                by_id.get(&link.run).copied().unwrap_or_else(|| {
                    tracing::warn!(
                        "Run {}: child run {} has no stored record",
                        run.id.short_id(),
                        link.run.short_id()
                    );
                    RunState::Running
                })
            })
            .collect();

        let fresh = roll_up(
            &components,
            &children,
            run.cancel_requested,
            run.condition.is_some(),
        );
        if fresh != run.state {
            drift += 1;
            println!(
                "DRIFT {}: stored {}, recomputed {} [{}]",
                run.id.short_id(),
                run.state,
                fresh,
                run.render_progress()
            );
        }
    }

    println!(
        "Checked {} run(s): {} consistent, {} drifted.",
        runs.len(),
        runs.len() - drift,
        drift
    );
    if drift > 0 {
        return Err(CliError::InconsistentRuns { count: drift });
    }
    Ok(())
}
