use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse run request: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] drover_core::errors::ConfigError),

    #[error(transparent)]
    Record(#[from] drover_core::record::RecordError),

    #[error(transparent)]
    Registry(#[from] drover_core::registry::RegistryError),

    #[error(transparent)]
    Sandbox(#[from] drover_sandbox::SandboxError),

    #[error(transparent)]
    Cluster(#[from] drover_cluster::ClusterError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
