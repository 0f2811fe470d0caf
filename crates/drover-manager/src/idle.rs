use drover_core::config::{LoggingConfig, PurgeConfig};
use drover_core::constants::files;
use drover_core::state::Run;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

/// Outcome of giving one maintenance task a turn.
pub enum IdleStatus {
    /// Did a bounded slice of work; wants more turns.
    Yielded,
    /// Finished for good; leaves the rotation.
    Done,
    /// Broke; leaves the rotation so it cannot wedge the scheduler.
    Failed(String),
}

/// A long-lived, resumable maintenance routine. The source drove these as
/// Python generators via `.send()`; here each task keeps its own
/// continuation state in its struct and is resumed explicitly.
pub trait IdleTask: Send {
    fn name(&self) -> &str;
    fn resume(&mut self, deadline: Instant) -> IdleStatus;
}

/// Round-robin scheduler for idle tasks. Each pass gives every task at
/// most one turn and stops as soon as the deadline is hit; the rotation
/// carries over between passes, so tasks that missed out go first next
/// time.
#[derive(Default)]
pub struct IdleScheduler {
    tasks: VecDeque<Box<dyn IdleTask>>,
}

impl IdleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Box<dyn IdleTask>) {
        tracing::debug!("Registered idle task '{}'", task.name());
        self.tasks.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn run_until(&mut self, deadline: Instant) {
        let mut turns = self.tasks.len();
        while turns > 0 && Instant::now() < deadline {
            turns -= 1;
            let Some(mut task) = self.tasks.pop_front() else {
                break;
            };
            match task.resume(deadline) {
                IdleStatus::Yielded => self.tasks.push_back(task),
                IdleStatus::Done => {
                    tracing::info!("Idle task '{}' finished", task.name());
                }
                IdleStatus::Failed(message) => {
                    tracing::error!(
                        "Idle task '{}' failed and was removed: {}",
                        task.name(),
                        message
                    );
                }
            }
        }
    }
}

/// Sandbox directories of terminal runs older than the retention window.
/// Scans once, then deletes one directory per turn.
pub struct SandboxPurgeTask {
    root: PathBuf,
    max_age: Duration,
    pending: VecDeque<PathBuf>,
}

impl SandboxPurgeTask {
    pub fn new(root: PathBuf, config: &PurgeConfig) -> Self {
        Self {
            root,
            max_age: Duration::from_secs(config.sandbox_age_days * 24 * 60 * 60),
            pending: VecDeque::new(),
        }
    }
}

/// One-shot scan shared with the `purge-sandboxes` CLI command.
pub fn expired_sandboxes(root: &std::path::Path, max_age: Duration) -> std::io::Result<Vec<PathBuf>> {
    let mut expired = Vec::new();
    if !root.is_dir() {
        return Ok(expired);
    }
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
    for entry in fs_err::read_dir(root)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let run_json = entry.path().join(files::RUN_JSON);
        let Ok(run) = Run::load(&run_json) else {
            continue;
        };
        let old_enough = run.ended_at.map(|t| t < cutoff).unwrap_or(false);
        if run.state.is_terminal() && old_enough {
            expired.push(entry.path());
        }
    }
    Ok(expired)
}

impl IdleTask for SandboxPurgeTask {
    fn name(&self) -> &str {
        "sandbox-purge"
    }

    fn resume(&mut self, _deadline: Instant) -> IdleStatus {
        if let Some(dir) = self.pending.pop_front() {
            tracing::info!("Purging expired sandbox {}", dir.display());
            if let Err(e) = fs_err::remove_dir_all(&dir) {
                tracing::warn!("Failed to purge sandbox {}: {}", dir.display(), e);
            }
            return IdleStatus::Yielded;
        }
        match expired_sandboxes(&self.root, self.max_age) {
            Ok(expired) => {
                self.pending = expired.into();
                IdleStatus::Yielded
            }
            Err(e) => IdleStatus::Failed(e.to_string()),
        }
    }
}

/// Dataset-registry entries untouched for longer than the retention
/// window. Purged data is regenerable: any record still referencing it
/// triggers recovery on next use.
pub struct DatasetPurgeTask {
    root: PathBuf,
    max_age: Duration,
    pending: VecDeque<PathBuf>,
}

impl DatasetPurgeTask {
    pub fn new(root: PathBuf, config: &PurgeConfig) -> Self {
        Self {
            root,
            max_age: Duration::from_secs(config.dataset_age_days * 24 * 60 * 60),
            pending: VecDeque::new(),
        }
    }

    fn scan(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut stale = Vec::new();
        if !self.root.is_dir() {
            return Ok(stale);
        }
        let now = SystemTime::now();
        for entry in fs_err::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() > self.max_age {
                stale.push(path);
            }
        }
        Ok(stale)
    }
}

impl IdleTask for DatasetPurgeTask {
    fn name(&self) -> &str {
        "dataset-purge"
    }

    fn resume(&mut self, _deadline: Instant) -> IdleStatus {
        if let Some(path) = self.pending.pop_front() {
            tracing::info!("Purging stale dataset {}", path.display());
            if let Err(e) = fs_err::remove_file(&path) {
                tracing::warn!("Failed to purge dataset {}: {}", path.display(), e);
            }
            return IdleStatus::Yielded;
        }
        match self.scan() {
            Ok(stale) => {
                self.pending = stale.into();
                IdleStatus::Yielded
            }
            Err(e) => IdleStatus::Failed(e.to_string()),
        }
    }
}

/// Session-log rotation, reusing the same policy the logger applies at
/// startup.
pub struct LogPurgeTask {
    config: LoggingConfig,
}

impl LogPurgeTask {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }
}

impl IdleTask for LogPurgeTask {
    fn name(&self) -> &str {
        "log-purge"
    }

    fn resume(&mut self, _deadline: Instant) -> IdleStatus {
        let xdg_dirs = xdg_cache_logs();
        let Some(logs_dir) = xdg_dirs else {
            return IdleStatus::Done;
        };
        match drover_core::logging::rotate_logs(&logs_dir, "drover_", &self.config) {
            Ok(()) => IdleStatus::Yielded,
            Err(e) => IdleStatus::Failed(e.to_string()),
        }
    }
}

fn xdg_cache_logs() -> Option<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("drover");
    dirs.get_cache_home().map(|home| home.join("logs"))
}
