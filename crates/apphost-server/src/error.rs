use std::path::PathBuf;
use std::time::Duration;

use apphost_common::HostError;
use thiserror::Error;

/// Failure to turn a source file into an export, or to run one.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Can't read file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{key}: {message}")]
    Compile { key: String, message: String },

    #[error("{key}: {message}")]
    Execution { key: String, message: String },

    #[error("{key}: script timed out after {}ms", elapsed.as_millis())]
    Timeout { key: String, elapsed: Duration },

    #[error("{key}: panic during script execution: {message}")]
    Panic { key: String, message: String },

    #[error("Can't build sandbox for {app}: {message}")]
    Sandbox { app: String, message: String },

    #[error(transparent)]
    Host(#[from] HostError),
}

impl LoadError {
    /// Cache key (application-relative path) of the failing script, if known.
    pub fn key(&self) -> Option<&str> {
        match self {
            LoadError::Read { .. } | LoadError::Sandbox { .. } | LoadError::Host(_) => None,
            LoadError::Compile { key, .. }
            | LoadError::Execution { key, .. }
            | LoadError::Timeout { key, .. }
            | LoadError::Panic { key, .. } => Some(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = LoadError::Timeout {
            key: "/lib/spin.js".into(),
            elapsed: Duration::from_millis(612),
        };
        assert_eq!(err.to_string(), "/lib/spin.js: script timed out after 612ms");
        assert_eq!(err.key(), Some("/lib/spin.js"));
    }

    #[test]
    fn test_read_error_has_no_key() {
        let err = LoadError::Read {
            path: PathBuf::from("/srv/app/lib/a.js"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.key().is_none());
        assert!(err.to_string().starts_with("Can't read file /srv/app/lib/a.js"));
    }
}
