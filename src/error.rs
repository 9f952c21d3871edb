use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Environment {0} is not defined")]
    EnvNotFound(String),

    #[error("Could not find a conda executable (set CONDA_EXE or put conda on PATH)")]
    CondaNotFound,

    #[error("Could not determine a python version for environment {0}")]
    PythonNotFound(String),

    #[error("Failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment marker error: {0}")]
    Marker(#[from] serde_json::Error),
}

impl RunnerError {
    /// Maps an error to the process exit code reported by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::CondaNotFound | RunnerError::PythonNotFound(_) => 3,
            RunnerError::Config { .. } | RunnerError::InvalidConfig(_) => 5,
            RunnerError::EnvNotFound(_) => 6,
            _ => 1,
        }
    }
}
