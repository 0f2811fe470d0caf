mod check;
mod manager;
mod purge;
mod status;

pub use check::handle_check_runs;
pub use manager::handle_manager;
pub use purge::handle_purge_sandboxes;
pub use status::handle_status;

use drover_core::constants::files;
use drover_core::state::Run;
use std::path::Path;

/// Loads every persisted run under the sandbox root, skipping directories
/// that do not hold a readable run record.
pub fn load_all_runs(sandbox_root: &Path) -> std::io::Result<Vec<Run>> {
    let mut runs = Vec::new();
    if !sandbox_root.is_dir() {
        return Ok(runs);
    }
    for entry in fs_err::read_dir(sandbox_root)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        match Run::load(&entry.path().join(files::RUN_JSON)) {
            Ok(run) => runs.push(run),
            Err(e) => {
                tracing::warn!("Skipping {}: {}", entry.path().display(), e);
            }
        }
    }
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(runs)
}
