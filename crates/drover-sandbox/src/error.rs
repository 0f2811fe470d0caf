use drover_core::errors::PipelineError;
use drover_core::record::RecordError;
use drover_core::registry::RegistryError;
use drover_core::state::ComponentId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] drover_core::errors::ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Run has no component {0}.")]
    UnknownComponent(ComponentId),

    #[error("Component {0} finished but was never dispatched.")]
    NotDispatched(ComponentId),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
