use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize TOML configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    General(String),

    #[error("Configuration file not found at '{0}'. Pass --config or create the default config under the XDG config home.")]
    ConfigNotFound(PathBuf),

    #[error("Could not determine a cache directory for drover.")]
    CacheDirectoryNotFound,
}

/// Errors in the pipeline definition itself. These are fatal for the run
/// that carries them and are never retried.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Step {step} input '{input}' has no source: it is neither a declared run input nor produced by any step.")]
    UnresolvableSource { step: usize, input: String },

    #[error("Step {step} references step {referenced}, which does not exist.")]
    UnknownStep { step: usize, referenced: usize },

    #[error("Step {step} references output '{output}' of step {referenced}, which that step does not produce.")]
    UnknownOutput {
        step: usize,
        referenced: usize,
        output: String,
    },

    #[error("Run input index {index} is out of range; the pipeline declares {declared} input(s).")]
    InputOutOfRange { index: usize, declared: usize },

    #[error("Step {step} input '{input}' is wired more than once.")]
    DuplicateWiring { step: usize, input: String },

    #[error("Step {step} input '{input}' is not an input of its transformation.")]
    NotAnInput { step: usize, input: String },

    #[error("Pipeline '{0}' contains a dependency cycle.")]
    CycleDetected(String),

    #[error("Run was given {given} input(s) but the pipeline declares {declared}.")]
    WrongInputCount { given: usize, declared: usize },

    #[error("Pipeline output '{name}' has an unresolvable source.")]
    UnresolvableOutput { name: String },

    #[error("Pipeline '{0}' has no steps.")]
    Empty(String),
}
