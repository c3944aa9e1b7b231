use std::path::PathBuf;
use thiserror::Error;

/// Errors shared by every apphost layer.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error in {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("Can't bind to {address}")]
    Bind { address: String },

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Invalid environment: {0}")]
    Environment(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Builds a configuration error for `path`.
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        HostError::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for listener bind failures.
    pub fn is_bind(&self) -> bool {
        matches!(self, HostError::Bind { .. })
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_message() {
        let err = HostError::Bind { address: "127.0.0.1:80".into() };
        assert!(err.is_bind());
        assert_eq!(err.to_string(), "Can't bind to 127.0.0.1:80");
    }

    #[test]
    fn test_config_error_mentions_path() {
        let err = HostError::config("/srv/config/servers.toml", "missing ports");
        assert!(!err.is_bind());
        assert!(err.to_string().contains("servers.toml"));
        assert!(err.to_string().contains("missing ports"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HostError = io.into();
        assert!(matches!(err, HostError::Io(_)));
    }
}
