use crate::cli::ManagerArgs;
use crate::error::Result;
use drover_core::config::Config;
use drover_manager::Manager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn handle_manager(args: ManagerArgs, config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    }) {
        tracing::warn!("Could not install a Ctrl-C handler: {}", e);
    }

    let mut manager = Manager::new(config)?;
    manager.run(args.quit_idle, &shutdown)?;
    Ok(())
}
