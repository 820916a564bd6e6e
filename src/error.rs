use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::platform::Signal;

/// Result type for sandbox operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Kind of access a grant confers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => f.write_str("read"),
            Access::Write => f.write_str("write"),
        }
    }
}

/// Errors that can occur during sandbox operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("no usable sandbox backend: {0}")]
    EnvironmentUnsupported(String),

    #[error("required tool `{0}` not found")]
    ToolNotFound(&'static str),

    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("user {user} lacks {access} access to {}", path.display())]
    AccessDenied {
        user: String,
        path: PathBuf,
        access: Access,
    },

    #[error("{operation} failed{}: {source}", path.as_ref().map(|p| format!(" for {}", p.display())).unwrap_or_default())]
    Os {
        operation: &'static str,
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("cannot hard-link {} into any proxy root (different volume)", .0.display())]
    ProxyLinkUnavailable(PathBuf),

    #[error("invalid sandbox id {0:?}")]
    InvalidId(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid sandbox profile: {0}")]
    InvalidProfile(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("state file {} is corrupt: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("timed out after {0:?} waiting for process")]
    Timeout(Duration),

    #[error("signal {0:?} is not supported on this platform")]
    UnsupportedSignal(Signal),

    #[error("hardening step `{step}` failed: {reason}")]
    Hardening { step: &'static str, reason: String },

    #[error("command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error("process execution failed: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an OS failure with the name of the failing operation
    pub(crate) fn os(operation: &'static str, source: io::Error) -> Self {
        Error::Os {
            operation,
            path: None,
            source,
        }
    }

    /// Wrap an OS failure that concerns a specific path
    pub(crate) fn os_path(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Error::Os {
            operation,
            path: Some(path.into()),
            source,
        }
    }

    /// Whether the error means the target is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::PathNotFound(_) => true,
            Error::Os { source, .. } | Error::Io(source) => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
