mod error;
mod idle;
mod manager;
mod queue;

pub use error::{ManagerError, Result};
pub use idle::{
    expired_sandboxes, DatasetPurgeTask, IdleScheduler, IdleStatus, IdleTask, LogPurgeTask,
    SandboxPurgeTask,
};
pub use manager::Manager;
pub use queue::{drain_spool, RunRequest};
