mod error;
mod local;
mod slurm;
mod task;

pub use error::{ClusterError, Result};
pub use local::LocalPool;
pub use slurm::SlurmClient;
pub use task::{TaskDescriptor, TaskId, TaskKind};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub exit_code: i32,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Pending,
    Running,
    Done(TaskOutcome),
    /// The backend can no longer account for the task. Surfaced only after
    /// bounded retries; the manager treats it as a failure, never a silent
    /// drop.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterCapacity {
    pub max_threads: u32,
    pub max_memory_mb: u64,
}

impl ClusterCapacity {
    /// Could a task with these requirements ever run here, on an otherwise
    /// idle cluster? "No" is fatal for the requesting run.
    pub fn can_ever_fit(&self, threads: u32, memory_mb: u64) -> bool {
        threads <= self.max_threads && memory_mb <= self.max_memory_mb
    }
}

/// Where tasks actually run. One realization is an in-process worker pool,
/// the other a batch-scheduler client; the manager does not care which.
pub trait ClusterInterface: Send {
    fn submit(&mut self, task: &TaskDescriptor) -> Result<TaskHandle>;

    /// Non-blocking. `Done` and `Lost` are sticky: repeated polls of a
    /// finished handle return the same answer.
    fn poll(&mut self, handle: TaskHandle) -> Result<TaskPoll>;

    /// Best effort, and only meaningful for tasks that have not started;
    /// running tasks are drained, never killed.
    fn cancel(&mut self, handle: TaskHandle) -> Result<()>;

    fn capacity(&self) -> ClusterCapacity;
}
