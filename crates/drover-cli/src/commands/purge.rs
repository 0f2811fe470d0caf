use crate::cli::PurgeArgs;
use crate::error::Result;
use drover_core::config::Config;
use drover_manager::expired_sandboxes;
use std::time::Duration;

pub fn handle_purge_sandboxes(args: PurgeArgs, config: Config) -> Result<()> {
    let days = args
        .older_than_days
        .unwrap_or(config.purge.sandbox_age_days);
    let max_age = Duration::from_secs(days * 24 * 60 * 60);
    let root = config.sandboxes_dir();

    let expired = expired_sandboxes(&root, max_age)?;
    if expired.is_empty() {
        println!("No sandboxes older than {} day(s).", days);
        return Ok(());
    }

    for dir in &expired {
        match fs_err::remove_dir_all(dir) {
            Ok(()) => println!("Purged {}", dir.display()),
            Err(e) => tracing::warn!("Failed to purge {}: {}", dir.display(), e),
        }
    }
    println!("Purged {} sandbox(es).", expired.len());
    Ok(())
}
