use apphost_common::HostError;
use apphost_server::LoadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Can't start {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Can't create runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Can't read directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Memory limit exceeded: {0}, restarting")]
    MemoryLimit(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
