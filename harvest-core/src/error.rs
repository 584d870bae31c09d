//! Error taxonomy for log harvesting.
//!
//! Every failure is classified into one of five kinds so that callers can
//! decide between skipping a host, skipping a file, or skipping a node type.

use thiserror::Error;

/// Coarse classification used by the pass runner to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host unreachable; skip the host for this pass.
    Connectivity,
    /// Malformed listing or state content; drop the entry.
    Parse,
    /// A single file transfer failed; other files proceed.
    Transfer,
    /// Local destination cannot be written.
    Storage,
    /// Missing or invalid configuration for a node type.
    Config,
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Connectivity error on {host}: {message}")]
    Connectivity { host: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transfer error for {path}: {message}")]
    Transfer { path: String, message: String },

    #[error("Storage error at {path}: {message}")]
    Storage { path: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarvestError {
    pub fn connectivity(host: impl Into<String>, message: impl ToString) -> Self {
        HarvestError::Connectivity {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn transfer(path: impl Into<String>, message: impl ToString) -> Self {
        HarvestError::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(path: impl AsRef<std::path::Path>, message: impl ToString) -> Self {
        HarvestError::Storage {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Connectivity { .. } => ErrorKind::Connectivity,
            HarvestError::Parse(_) | HarvestError::Serialization(_) => ErrorKind::Parse,
            HarvestError::Transfer { .. } => ErrorKind::Transfer,
            HarvestError::Storage { .. } | HarvestError::Io(_) => ErrorKind::Storage,
            HarvestError::Config(_) => ErrorKind::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            HarvestError::connectivity("h1", "timed out").kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(
            HarvestError::transfer("/var/log/x", "exit 1").kind(),
            ErrorKind::Transfer
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(HarvestError::from(io).kind(), ErrorKind::Storage);
        assert_eq!(HarvestError::Config("x".into()).kind(), ErrorKind::Config);
    }

    #[test]
    fn test_display_includes_host() {
        let err = HarvestError::connectivity("cell01", "connection refused");
        assert_eq!(
            err.to_string(),
            "Connectivity error on cell01: connection refused"
        );
    }
}
