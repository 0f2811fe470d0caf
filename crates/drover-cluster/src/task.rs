use drover_core::constants::{files, logs, COPY_DRIVER};
use drover_core::model::RunId;
use drover_core::state::ComponentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(run: &RunId, component: ComponentId) -> Self {
        TaskId(format!("{}/{}", run.short_id(), component))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Step,
    Cable,
}

/// One flattened unit of dispatch. Everything the executor needs is in
/// here; the descriptor is also written as `task.json` in the task's
/// working directory for the external-executor contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub run: RunId,
    pub component: ComponentId,
    pub kind: TaskKind,
    pub driver: PathBuf,
    pub args: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub threads: u32,
    pub memory_mb: u64,
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
}

impl TaskDescriptor {
    pub fn stdout_path(&self) -> PathBuf {
        self.log_dir.join(logs::STDOUT)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.log_dir.join(logs::STDERR)
    }

    /// Exit-code marker written when the driver finishes; the batch
    /// backend reads it back since it cannot observe the process directly.
    pub fn rc_path(&self) -> PathBuf {
        self.log_dir.join(logs::RC)
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.workdir.join(files::TASK_JSON)
    }

    /// Creates the working/log/output directories and writes `task.json`.
    /// Drivers may assume their output parents exist.
    pub fn prepare(&self) -> crate::Result<()> {
        fs_err::create_dir_all(&self.workdir)?;
        fs_err::create_dir_all(&self.log_dir)?;
        for output in &self.outputs {
            if let Some(parent) = output.parent() {
                fs_err::create_dir_all(parent)?;
            }
        }
        fs_err::write(self.descriptor_path(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The argv to execute. Steps get their descriptor path as the final
    /// argument; cables are a plain copy of one file.
    pub fn command(&self) -> (PathBuf, Vec<String>) {
        match self.kind {
            TaskKind::Cable => {
                let mut args = Vec::new();
                if let Some(src) = self.inputs.first() {
                    args.push(src.to_string_lossy().to_string());
                }
                if let Some(dst) = self.outputs.first() {
                    args.push(dst.to_string_lossy().to_string());
                }
                (PathBuf::from(COPY_DRIVER), args)
            }
            TaskKind::Step => {
                let mut args = self.args.clone();
                args.push(self.descriptor_path().to_string_lossy().to_string());
                (self.driver.clone(), args)
            }
        }
    }
}
