use crate::TaskHandle;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize task descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to invoke '{command}': {source}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch scheduler rejected the submission: {stderr}")]
    SubmitRejected { stderr: String },

    #[error("Batch scheduler poll failed: {stderr}")]
    PollFailed { stderr: String },

    #[error("Could not parse a job id from sbatch output: '{stdout}'")]
    JobIdParse { stdout: String },

    #[error("Unknown task handle {0}.")]
    UnknownHandle(TaskHandle),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
