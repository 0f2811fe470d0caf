use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] drover_core::errors::ConfigError),

    #[error(transparent)]
    Manager(#[from] drover_manager::ManagerError),

    #[error("{count} run(s) have inconsistent cached state. See the report above.")]
    InconsistentRuns { count: usize },

    #[error("No run matches '{0}'.")]
    RunNotFound(String),
}

pub type Result<T> = std::result::Result<T, CliError>;
